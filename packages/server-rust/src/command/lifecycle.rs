use lintd_core::ProgressMonitor;

use super::dispatch::DispatchError;
use super::{Command, CommandKind};
use crate::module::{ModuleId, ModuleInfo, ModuleRegistry};

/// Registers a module, creating and starting its container.
#[derive(Debug, Clone)]
pub struct RegisterModuleCommand {
    module: ModuleInfo,
}

impl RegisterModuleCommand {
    #[must_use]
    pub fn new(module: ModuleInfo) -> Self {
        Self { module }
    }
}

impl Command for RegisterModuleCommand {
    type Output = ();

    fn kind(&self) -> CommandKind {
        CommandKind::RegisterModule
    }

    fn module_id(&self) -> Option<&ModuleId> {
        Some(&self.module.id)
    }

    fn execute(self, registry: &ModuleRegistry, _progress: &ProgressMonitor) -> Result<(), DispatchError> {
        registry.register_module(self.module)?;
        Ok(())
    }
}

/// Unregisters a module and stops its container.
#[derive(Debug, Clone)]
pub struct UnregisterModuleCommand {
    module: ModuleId,
}

impl UnregisterModuleCommand {
    #[must_use]
    pub fn new(module: ModuleId) -> Self {
        Self { module }
    }
}

impl Command for UnregisterModuleCommand {
    /// `false` if the module was not registered.
    type Output = bool;

    fn kind(&self) -> CommandKind {
        CommandKind::UnregisterModule
    }

    // Not targeting the module: unregistering cancels commands targeting it,
    // and this one must survive that.
    fn module_id(&self) -> Option<&ModuleId> {
        None
    }

    fn execute(self, registry: &ModuleRegistry, _progress: &ProgressMonitor) -> Result<bool, DispatchError> {
        Ok(registry.unregister_module(&self.module)?)
    }
}
