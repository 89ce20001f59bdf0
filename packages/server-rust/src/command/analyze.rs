use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lintd_core::ProgressMonitor;
use tracing::info;

use super::analysis::{AnalysisConfiguration, AnalysisKey, AnalysisResults, Issue, TriggerType};
use super::dispatch::{self, ContainerCommand, DispatchError};
use super::{Command, CommandKind};
use crate::container::Container;
use crate::module::{ModuleId, ModuleRegistry};

type IssueListener = Arc<dyn Fn(Issue) + Send + Sync>;

/// Analyzes a set of files, in the module's container when the module is
/// registered and in a transient container otherwise.
pub struct AnalyzeCommand {
    module: Option<ModuleId>,
    configuration: AnalysisConfiguration,
    trigger: TriggerType,
    issue_listener: IssueListener,
}

impl fmt::Debug for AnalyzeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzeCommand")
            .field("module", &self.module)
            .field("files", &self.configuration.input_files.len())
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl AnalyzeCommand {
    pub fn new(
        module: Option<ModuleId>,
        configuration: AnalysisConfiguration,
        issue_listener: impl Fn(Issue) + Send + Sync + 'static,
    ) -> Self {
        Self {
            module,
            configuration,
            trigger: TriggerType::default(),
            issue_listener: Arc::new(issue_listener),
        }
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerType) -> Self {
        self.trigger = trigger;
        self
    }

    #[must_use]
    pub fn trigger(&self) -> TriggerType {
        self.trigger
    }

    #[must_use]
    pub fn configuration(&self) -> &AnalysisConfiguration {
        &self.configuration
    }
}

impl ContainerCommand for AnalyzeCommand {
    type Output = AnalysisResults;

    fn target_module(&self) -> Option<&ModuleId> {
        self.module.as_ref()
    }

    fn transient_input(&self) -> &AnalysisConfiguration {
        &self.configuration
    }

    fn run(&mut self, container: &Container, progress: &ProgressMonitor) -> anyhow::Result<AnalysisResults> {
        let analyzer = container.analyzer()?;
        let issue_count = AtomicUsize::new(0);
        let listener = &self.issue_listener;
        let counting = |issue: Issue| {
            issue_count.fetch_add(1, Ordering::Relaxed);
            listener(issue);
        };

        let started = Instant::now();
        let mut results = analyzer.analyze(&self.configuration, &counting, progress)?;
        results.issue_count = issue_count.load(Ordering::Relaxed);
        results.duration = started.elapsed();
        Ok(results)
    }
}

impl Command for AnalyzeCommand {
    type Output = AnalysisResults;

    fn kind(&self) -> CommandKind {
        CommandKind::Analyze
    }

    fn module_id(&self) -> Option<&ModuleId> {
        self.module.as_ref()
    }

    fn analysis_key(&self) -> Option<AnalysisKey> {
        (self.trigger == TriggerType::Auto).then(|| AnalysisKey {
            module: self.module.clone(),
            files: self.configuration.file_uris(),
        })
    }

    fn execute(
        mut self,
        registry: &ModuleRegistry,
        progress: &ProgressMonitor,
    ) -> Result<AnalysisResults, DispatchError> {
        if self.configuration.input_files.is_empty() {
            info!("no file to analyze");
            return Ok(AnalysisResults::default());
        }
        info!(
            files = self.configuration.input_files.len(),
            rules = self.configuration.active_rules.len(),
            trigger = ?self.trigger,
            "starting analysis"
        );
        dispatch::execute(&mut self, registry, progress)
    }
}
