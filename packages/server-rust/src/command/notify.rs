use lintd_core::ProgressMonitor;
use tracing::debug;

use super::analysis::ModuleFileEvent;
use super::dispatch::DispatchError;
use super::{Command, CommandKind};
use crate::module::{ModuleId, ModuleRegistry};

/// Forwards a file change to a registered module's analyzer.
///
/// Events for modules that are not registered are dropped: there is no
/// transient fallback for file events.
#[derive(Debug, Clone)]
pub struct NotifyModuleEventCommand {
    module: ModuleId,
    event: ModuleFileEvent,
}

impl NotifyModuleEventCommand {
    #[must_use]
    pub fn new(module: ModuleId, event: ModuleFileEvent) -> Self {
        Self { module, event }
    }
}

impl Command for NotifyModuleEventCommand {
    /// `true` if the event reached a module.
    type Output = bool;

    fn kind(&self) -> CommandKind {
        CommandKind::NotifyModuleEvent
    }

    fn module_id(&self) -> Option<&ModuleId> {
        Some(&self.module)
    }

    fn execute(self, registry: &ModuleRegistry, progress: &ProgressMonitor) -> Result<bool, DispatchError> {
        if progress.is_canceled() {
            return Err(DispatchError::Canceled);
        }
        let Some(container) = registry.get_container_for(&self.module) else {
            debug!(module = %self.module, uri = %self.event.file.uri, "dropping file event for unregistered module");
            return Ok(false);
        };
        let analyzer = container
            .analyzer()
            .map_err(|err| DispatchError::Execution(err.into()))?;
        analyzer
            .notify_file_event(&self.event)
            .map_err(DispatchError::Execution)?;
        Ok(true)
    }
}
