//! End-to-end flows through the engine, the registry and dispatch, with fake
//! analyzers sharing a rules cache held by the global container.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lintd_core::{CancelChecker, CancelableLoadingCache, ProgressMonitor};
use lintd_server::command::analysis::Severity;
use lintd_server::config::BackendConfig;
use lintd_server::{
    AnalysisCapability, AnalysisConfiguration, AnalysisEngine, AnalysisResults, AnalyzeCommand,
    Component, Container, ContainerFactory, DispatchError, EngineError, InputFile, Issue,
    ModuleAnalyzer, ModuleId, ModuleInfo, ModuleRegistry,
};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Active rules per language, shared by every container through the global
/// container.
struct RulesCache {
    cache: CancelableLoadingCache<String, Vec<String>>,
    loads: Arc<AtomicU32>,
}

impl RulesCache {
    fn new(config: &BackendConfig) -> Self {
        let loads = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&loads);
        let cache = CancelableLoadingCache::new(
            config.cache.cache_name("rules"),
            move |language: &String, checker: &CancelChecker| {
                checker.check()?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![format!("{language}:S100"), format!("{language}:S101")])
            },
            |_language: &String, _old: Option<&Vec<String>>, _new: &Vec<String>| {},
        );
        Self { cache, loads }
    }
}

impl Component for RulesCache {
    fn name(&self) -> &'static str {
        "rules-cache"
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.cache.close();
        Ok(())
    }
}

/// Raises one issue per active rule per file.
struct RuleAnalyzer {
    rules: Arc<RulesCache>,
    fail: bool,
}

impl ModuleAnalyzer for RuleAnalyzer {
    fn analyze(
        &self,
        configuration: &AnalysisConfiguration,
        issues: &dyn Fn(Issue),
        progress: &ProgressMonitor,
    ) -> anyhow::Result<AnalysisResults> {
        if self.fail {
            anyhow::bail!("analyzer crashed");
        }
        let total = configuration.input_files.len().max(1);
        for (i, file) in configuration.input_files.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let fraction = i as f32 / total as f32;
            progress.set_progress_and_check_cancel(&file.uri, fraction)?;
            let language = file.language.clone().unwrap_or_else(|| "rust".to_string());
            for rule in self.rules.cache.get(&language)? {
                issues(Issue {
                    rule_key: rule,
                    message: "finding".to_string(),
                    severity: Severity::Major,
                    file_uri: Some(file.uri.clone()),
                });
            }
        }
        Ok(AnalysisResults::default())
    }
}

struct FailingStop;

impl Component for FailingStop {
    fn name(&self) -> &'static str {
        "failing-stop"
    }

    fn stop(&self) -> anyhow::Result<()> {
        anyhow::bail!("could not release transient resources")
    }
}

#[derive(Default)]
struct Factory {
    transient_analyzer_fails: bool,
    transient_stop_fails: bool,
}

impl Factory {
    fn analyzer(container: &Container, fail: bool) -> anyhow::Result<()> {
        let rules = container.lookup::<RulesCache>()?;
        container.add(AnalysisCapability::new(Arc::new(RuleAnalyzer { rules, fail })))?;
        Ok(())
    }
}

impl ContainerFactory for Factory {
    fn configure_module(&self, container: &Container, _module: &ModuleInfo) -> anyhow::Result<()> {
        Self::analyzer(container, false)
    }

    fn configure_transient(
        &self,
        container: &Container,
        _configuration: &AnalysisConfiguration,
    ) -> anyhow::Result<()> {
        if self.transient_stop_fails {
            container.add(FailingStop)?;
        }
        Self::analyzer(container, self.transient_analyzer_fails)
    }
}

fn start_engine(factory: Factory, modules: Vec<ModuleInfo>) -> (AnalysisEngine, Arc<RulesCache>) {
    let config = BackendConfig::default();
    let global = Arc::new(Container::new("global"));
    let rules = global.add(RulesCache::new(&config)).unwrap();
    let registry = ModuleRegistry::new(global, Arc::new(factory), &modules).unwrap();
    (AnalysisEngine::start(config.engine, Arc::new(registry)), rules)
}

fn analysis(module: Option<&str>, uris: &[&str], issues: &Arc<Mutex<Vec<Issue>>>) -> AnalyzeCommand {
    let sink = Arc::clone(issues);
    AnalyzeCommand::new(
        module.map(ModuleId::from),
        AnalysisConfiguration {
            input_files: uris.iter().map(|u| InputFile::new(*u)).collect(),
            ..AnalysisConfiguration::default()
        },
        move |issue: Issue| sink.lock().push(issue),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn module_lifecycle_end_to_end() {
    let (engine, rules) = start_engine(Factory::default(), vec![ModuleInfo::new("m1")]);
    let issues = Arc::new(Mutex::new(Vec::new()));

    let results = engine
        .analyze(
            analysis(Some("m1"), &["file:///a.rs", "file:///b.rs"], &issues),
            ProgressMonitor::detached(),
        )
        .join()
        .await
        .unwrap();
    assert_eq!(results.issue_count, 4);
    assert_eq!(issues.lock().len(), 4);

    engine.register_module(ModuleInfo::new("m2")).join().await.unwrap();
    engine
        .analyze(analysis(Some("m2"), &["file:///c.rs"], &issues), ProgressMonitor::detached())
        .join()
        .await
        .unwrap();
    // Both modules resolve the same rules through the global container.
    assert_eq!(rules.loads.load(Ordering::SeqCst), 1);

    assert!(engine.unregister_module(ModuleId::from("m1")).join().await.unwrap());
    assert!(engine.registry().get_container_for(&ModuleId::from("m1")).is_none());
    assert!(!engine.unregister_module(ModuleId::from("m1")).join().await.unwrap());

    // An unregistered module falls back to a transient container.
    let results = engine
        .analyze(analysis(Some("m1"), &["file:///a.rs"], &issues), ProgressMonitor::detached())
        .join()
        .await
        .unwrap();
    assert_eq!(results.issue_count, 2);

    engine.stop().await.unwrap();
    assert!(engine.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_teardown_failure_carries_analysis_failure() {
    let (engine, _rules) = start_engine(
        Factory {
            transient_analyzer_fails: true,
            transient_stop_fails: true,
        },
        Vec::new(),
    );
    let issues = Arc::new(Mutex::new(Vec::new()));

    let err = engine
        .analyze(analysis(None, &["file:///a.rs"], &issues), ProgressMonitor::detached())
        .join()
        .await
        .unwrap_err();

    let EngineError::Dispatch(DispatchError::Teardown(composite)) = err else {
        panic!("expected a teardown failure");
    };
    assert!(format!("{:#}", composite.primary()).contains("could not release"));
    assert_eq!(composite.suppressed().len(), 1);
    assert!(composite.suppressed()[0].to_string().contains("analyzer crashed"));
    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_teardown_failure_alone_is_reported() {
    let (engine, _rules) = start_engine(
        Factory {
            transient_analyzer_fails: false,
            transient_stop_fails: true,
        },
        Vec::new(),
    );
    let issues = Arc::new(Mutex::new(Vec::new()));

    let err = engine
        .analyze(analysis(None, &["file:///a.rs"], &issues), ProgressMonitor::detached())
        .join()
        .await
        .unwrap_err();

    let EngineError::Dispatch(DispatchError::Teardown(composite)) = err else {
        panic!("expected a teardown failure");
    };
    assert!(composite.suppressed().is_empty());
    // The analysis itself ran and reported its issues.
    assert_eq!(issues.lock().len(), 2);
    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_the_engine_closes_the_shared_cache() {
    let (engine, rules) = start_engine(Factory::default(), vec![ModuleInfo::new("m1")]);
    let issues = Arc::new(Mutex::new(Vec::new()));
    engine
        .analyze(analysis(Some("m1"), &["file:///a.rs"], &issues), ProgressMonitor::detached())
        .join()
        .await
        .unwrap();

    engine.stop().await.unwrap();

    assert!(matches!(
        rules.cache.get(&"rust".to_string()),
        Err(lintd_core::CacheError::Closed(_))
    ));
}
