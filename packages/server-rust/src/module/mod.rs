//! Modules known to the backend and the registry of their containers.

mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::analysis::AnalysisConfiguration;
use crate::container::Container;

pub use registry::{ModuleRegistry, RegistryError};

/// Client-chosen identifier of a module (typically a workspace folder key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration payload for a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    /// Opaque client data handed to the [`ContainerFactory`].
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ModuleInfo {
    pub fn new(id: impl Into<ModuleId>) -> Self {
        Self {
            id: id.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Enumerates the modules known when the backend starts.
pub trait ModulesProvider: Send + Sync {
    fn modules(&self) -> Vec<ModuleInfo>;
}

impl ModulesProvider for Vec<ModuleInfo> {
    fn modules(&self) -> Vec<ModuleInfo> {
        self.clone()
    }
}

/// Populates new containers with their components.
///
/// Implementations must not call back into the [`ModuleRegistry`].
pub trait ContainerFactory: Send + Sync {
    /// Adds the components of a persistent module container.
    fn configure_module(&self, container: &Container, module: &ModuleInfo) -> anyhow::Result<()>;

    /// Adds the components of a transient container built for one analysis.
    fn configure_transient(
        &self,
        container: &Container,
        configuration: &AnalysisConfiguration,
    ) -> anyhow::Result<()>;
}
