//! The analysis capability a module or transient container exposes.

use std::sync::Arc;

use lintd_core::ProgressMonitor;

use super::{Component, Container, ContainerError};
use crate::command::analysis::{AnalysisConfiguration, AnalysisResults, Issue, ModuleFileEvent};

/// Analysis algorithms plugged into a container by its factory.
pub trait ModuleAnalyzer: Send + Sync {
    /// Analyzes `configuration`, reporting each issue through `issues`.
    ///
    /// Implementations should poll `progress` and return
    /// [`Canceled`](lintd_core::Canceled) once it is canceled.
    fn analyze(
        &self,
        configuration: &AnalysisConfiguration,
        issues: &dyn Fn(Issue),
        progress: &ProgressMonitor,
    ) -> anyhow::Result<AnalysisResults>;

    /// Applies a file change to the analyzer's view of the module.
    fn notify_file_event(&self, _event: &ModuleFileEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the owning container starts.
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the owning container stops.
    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Component wrapper making a [`ModuleAnalyzer`] available to commands.
pub struct AnalysisCapability {
    analyzer: Arc<dyn ModuleAnalyzer>,
}

impl AnalysisCapability {
    pub fn new(analyzer: Arc<dyn ModuleAnalyzer>) -> Self {
        Self { analyzer }
    }

    #[must_use]
    pub fn analyzer(&self) -> &Arc<dyn ModuleAnalyzer> {
        &self.analyzer
    }
}

impl Component for AnalysisCapability {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    fn start(&self) -> anyhow::Result<()> {
        self.analyzer.start()
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.analyzer.stop()
    }
}

impl Container {
    /// The analyzer visible from this container.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NotFound`] if no [`AnalysisCapability`] was
    /// registered here or in a parent.
    pub fn analyzer(&self) -> Result<Arc<dyn ModuleAnalyzer>, ContainerError> {
        self.lookup::<AnalysisCapability>()
            .map(|capability| Arc::clone(capability.analyzer()))
    }
}
