//! Module id -> container registry.
//!
//! Each registered module owns exactly one started, persistent container,
//! created as a child of the registry's global container. Transient
//! containers for module-less analyses are built here too but never stored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lintd_core::CompositeError;
use parking_lot::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ContainerFactory, ModuleId, ModuleInfo, ModulesProvider};
use crate::command::analysis::AnalysisConfiguration;
use crate::container::{Container, ContainerError, ContainerState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`ModuleRegistry`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to configure container '{container}': {source}")]
    Configure {
        container: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// [`ModuleRegistry::stop_all`] has run; no container can be created.
    #[error("module registry is shut down")]
    ShutDown,
    #[error("{failed} container(s) failed to stop: {source}")]
    StopAll {
        failed: usize,
        #[source]
        source: CompositeError,
    },
}

// ---------------------------------------------------------------------------
// ModuleSlot
// ---------------------------------------------------------------------------

/// Map value for one module. `starting` is held by the registering thread
/// until the container's start has settled, so readers of the slot wait for
/// that one module only and never under a map shard lock.
struct ModuleSlot {
    container: Arc<Container>,
    starting: Mutex<()>,
}

impl ModuleSlot {
    fn new(container: Arc<Container>) -> Arc<Self> {
        Arc::new(Self {
            container,
            starting: Mutex::new(()),
        })
    }

    /// Waits for the start to settle. `None` unless the container is running.
    fn started(&self) -> Option<Arc<Container>> {
        let _settled = self.starting.lock();
        (self.container.state() == ContainerState::Started).then(|| Arc::clone(&self.container))
    }
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Registry of per-module containers.
///
/// Registration builds and configures a container speculatively, claims the
/// map entry for its id with an unstarted slot, then starts the container
/// after the map lock is released. Concurrent registrations of one id start
/// exactly one container and the losers are dropped unstarted. Unregistration
/// removes the entry atomically, waits for a pending start, and stops the
/// removed container outside the map lock.
///
/// A module's own components and post-start hook must not look the module up
/// in the registry while it starts.
pub struct ModuleRegistry {
    global: Arc<Container>,
    factory: Arc<dyn ContainerFactory>,
    containers: DashMap<ModuleId, Arc<ModuleSlot>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("global", &self.global.name())
            .field("modules", &self.containers.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    /// Starts `global` and registers every module `provider` knows about.
    ///
    /// The registry owns `global` from here on and stops it last in
    /// [`stop_all`](Self::stop_all).
    ///
    /// # Errors
    ///
    /// Fails if `global` cannot be started or an initial module cannot be
    /// registered. Containers started so far are stopped again.
    pub fn new(
        global: Arc<Container>,
        factory: Arc<dyn ContainerFactory>,
        provider: &dyn ModulesProvider,
    ) -> Result<Self, RegistryError> {
        global.start()?;
        let registry = Self {
            global,
            factory,
            containers: DashMap::new(),
            shut_down: AtomicBool::new(false),
        };
        for module in provider.modules() {
            if let Err(err) = registry.register_module(module) {
                if let Err(teardown) = registry.stop_all() {
                    error!(error = %teardown, "failed to tear down partially initialized registry");
                }
                return Err(err);
            }
        }
        Ok(registry)
    }

    /// The parent of every module and transient container.
    #[must_use]
    pub fn global(&self) -> &Arc<Container> {
        &self.global
    }

    /// `true` once [`stop_all`](Self::stop_all) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Registers `module` unless its id is already registered.
    ///
    /// Returns the module's container, which is the pre-existing one when the
    /// id was already registered. Waits for a concurrent registration of the
    /// same id to finish starting.
    ///
    /// # Errors
    ///
    /// Fails if the factory cannot configure the container or it fails to
    /// start, and with [`RegistryError::ShutDown`] after
    /// [`stop_all`](Self::stop_all); nothing is registered in those cases.
    pub fn register_module(&self, module: ModuleInfo) -> Result<Arc<Container>, RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        if let Some(existing) = self.get_container_for(&module.id) {
            debug!(module = %module.id, "module already registered");
            return Ok(existing);
        }

        let container = Arc::new(self.global.child(format!("module:{}", module.id)));
        self.factory
            .configure_module(&container, &module)
            .map_err(|source| RegistryError::Configure {
                container: container.name().to_string(),
                source,
            })?;
        let slot = ModuleSlot::new(Arc::clone(&container));

        loop {
            let starting = slot.starting.lock();
            let existing = match self.containers.entry(module.id.clone()) {
                Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&slot));
                    None
                }
            };

            if let Some(existing) = existing {
                drop(starting);
                if let Some(running) = existing.started() {
                    debug!(module = %module.id, "lost registration race, dropping unstarted container");
                    return Ok(running);
                }
                // The other registration failed or was unregistered meanwhile.
                continue;
            }

            if self.is_shut_down() {
                self.release(&module.id, &slot);
                return Err(RegistryError::ShutDown);
            }
            if let Err(err) = container.start() {
                self.release(&module.id, &slot);
                return Err(err.into());
            }
            drop(starting);
            info!(module = %module.id, "module registered");
            return Ok(container);
        }
    }

    /// Removes `slot` from the map unless it was replaced or removed already.
    fn release(&self, id: &ModuleId, slot: &Arc<ModuleSlot>) {
        self.containers
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot));
    }

    /// The container of a registered module, if any. Waits while that
    /// module's container is starting.
    #[must_use]
    pub fn get_container_for(&self, id: &ModuleId) -> Option<Arc<Container>> {
        let slot = self.containers.get(id).map(|entry| Arc::clone(entry.value()))?;
        slot.started()
    }

    /// Builds and starts a transient container for one analysis. The caller
    /// owns it and must stop it.
    ///
    /// # Errors
    ///
    /// Fails if the factory cannot configure the container or it fails to
    /// start, and with [`RegistryError::ShutDown`] after
    /// [`stop_all`](Self::stop_all).
    pub fn create_transient_container(
        &self,
        configuration: &AnalysisConfiguration,
    ) -> Result<Arc<Container>, RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        let container = self
            .global
            .transient_child(format!("transient:{}", Uuid::new_v4()));
        self.factory
            .configure_transient(&container, configuration)
            .map_err(|source| RegistryError::Configure {
                container: container.name().to_string(),
                source,
            })?;
        container.start()?;
        debug!(
            container = container.name(),
            files = configuration.input_files.len(),
            "transient container started"
        );
        Ok(Arc::new(container))
    }

    /// Removes a module and stops its container.
    ///
    /// Returns `false` (and does nothing) for an unknown id. A container
    /// still starting is stopped once its start settles.
    ///
    /// # Errors
    ///
    /// Returns the container's teardown error. The module is unregistered
    /// regardless.
    pub fn unregister_module(&self, id: &ModuleId) -> Result<bool, RegistryError> {
        let Some((_, slot)) = self.containers.remove(id) else {
            debug!(module = %id, "unregistering unknown module, ignoring");
            return Ok(false);
        };
        let Some(container) = slot.started() else {
            debug!(module = %id, "unregistered module whose container never started");
            return Ok(true);
        };
        container.stop()?;
        info!(module = %id, "module unregistered");
        Ok(true)
    }

    /// Ids of the registered modules, in no particular order.
    #[must_use]
    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.containers.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Shuts the registry down: rejects further registrations, unregisters
    /// every module, then stops the global container. Continues past
    /// failures and reports all of them.
    ///
    /// # Errors
    ///
    /// [`RegistryError::StopAll`] carrying every teardown failure.
    pub fn stop_all(&self) -> Result<(), RegistryError> {
        self.shut_down.store(true, Ordering::Release);
        let mut errors = Vec::new();
        for id in self.module_ids() {
            if let Err(err) = self.unregister_module(&id) {
                error!(module = %id, error = %err, "failed to stop module container");
                errors.push(anyhow::Error::new(err).context(format!("module '{id}'")));
            }
        }
        if self.global.state() != ContainerState::Stopped {
            if let Err(err) = self.global.stop() {
                error!(container = self.global.name(), error = %err, "failed to stop global container");
                errors.push(anyhow::Error::new(err));
            }
        }

        let failed = errors.len();
        match CompositeError::from_errors(errors) {
            None => Ok(()),
            Some(source) => Err(RegistryError::StopAll { failed, source }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::container::Component;

    #[derive(Default)]
    struct Counters {
        configured: AtomicU32,
        started: AtomicU32,
        stopped: AtomicU32,
    }

    struct Tracked {
        counters: Arc<Counters>,
        fail_stop: bool,
    }

    impl Component for Tracked {
        fn name(&self) -> &'static str {
            "tracked"
        }

        fn start(&self) -> anyhow::Result<()> {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> anyhow::Result<()> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                anyhow::bail!("tracked component refused to stop");
            }
            Ok(())
        }
    }

    /// Blocks a component's start until the test releases it.
    struct StartGate {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    struct GatedStart(Arc<StartGate>);

    impl Component for GatedStart {
        fn name(&self) -> &'static str {
            "gated-start"
        }

        fn start(&self) -> anyhow::Result<()> {
            let _ = self.0.entered.lock().send(());
            let _ = self.0.release.lock().recv();
            Ok(())
        }
    }

    #[derive(Default)]
    struct TrackedFactory {
        counters: Arc<Counters>,
        fail_stop_for: Option<ModuleId>,
        fail_configure_for: Option<ModuleId>,
        start_gate: Option<(ModuleId, Arc<StartGate>)>,
    }

    impl ContainerFactory for TrackedFactory {
        fn configure_module(&self, container: &Container, module: &ModuleInfo) -> anyhow::Result<()> {
            if self.fail_configure_for.as_ref() == Some(&module.id) {
                anyhow::bail!("cannot configure {}", module.id);
            }
            self.counters.configured.fetch_add(1, Ordering::SeqCst);
            container.add(Tracked {
                counters: Arc::clone(&self.counters),
                fail_stop: self.fail_stop_for.as_ref() == Some(&module.id),
            })?;
            if let Some((id, gate)) = &self.start_gate {
                if *id == module.id {
                    container.add(GatedStart(Arc::clone(gate)))?;
                }
            }
            Ok(())
        }

        fn configure_transient(
            &self,
            container: &Container,
            _configuration: &AnalysisConfiguration,
        ) -> anyhow::Result<()> {
            container.add(Tracked {
                counters: Arc::clone(&self.counters),
                fail_stop: false,
            })?;
            Ok(())
        }
    }

    fn registry_with(factory: TrackedFactory, modules: Vec<ModuleInfo>) -> (ModuleRegistry, Arc<Counters>) {
        let counters = Arc::clone(&factory.counters);
        let registry = ModuleRegistry::new(
            Arc::new(Container::new("global")),
            Arc::new(factory),
            &modules,
        )
        .unwrap();
        (registry, counters)
    }

    fn m(id: &str) -> ModuleId {
        ModuleId::from(id)
    }

    #[test]
    fn initial_modules_are_registered_and_started() {
        let (registry, counters) = registry_with(
            TrackedFactory::default(),
            vec![ModuleInfo::new("m1"), ModuleInfo::new("m2")],
        );

        assert_eq!(registry.len(), 2);
        assert!(registry.get_container_for(&m("m1")).is_some());
        assert!(registry.get_container_for(&m("m2")).is_some());
        assert_eq!(counters.started.load(Ordering::SeqCst), 2);
        let container = registry.get_container_for(&m("m1")).unwrap();
        assert_eq!(container.state(), ContainerState::Started);
        assert!(!container.is_transient());
    }

    #[test]
    fn register_then_unregister_twice() {
        let (registry, counters) = registry_with(TrackedFactory::default(), Vec::new());

        registry.register_module(ModuleInfo::new("m1")).unwrap();
        assert!(registry.get_container_for(&m("m1")).is_some());

        assert!(registry.unregister_module(&m("m1")).unwrap());
        assert!(registry.get_container_for(&m("m1")).is_none());

        assert!(!registry.unregister_module(&m("m1")).unwrap());
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_unregister_is_a_no_op() {
        let (registry, counters) = registry_with(TrackedFactory::default(), vec![ModuleInfo::new("m1")]);

        for _ in 0..3 {
            assert!(!registry.unregister_module(&m("unknown")).unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn double_register_keeps_first_container() {
        let (registry, counters) = registry_with(TrackedFactory::default(), Vec::new());

        let first = registry.register_module(ModuleInfo::new("m1")).unwrap();
        let second = registry.register_module(ModuleInfo::new("m1")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_registration_starts_exactly_one_container() {
        const THREADS: usize = 8;
        let (registry, counters) = registry_with(TrackedFactory::default(), Vec::new());
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.register_module(ModuleInfo::new("m1")).unwrap()
                })
            })
            .collect();
        let containers: Vec<Arc<Container>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let distinct: HashSet<*const Container> = containers.iter().map(Arc::as_ptr).collect();
        assert_eq!(distinct.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_configuration_registers_nothing() {
        let factory = TrackedFactory {
            fail_configure_for: Some(m("bad")),
            ..TrackedFactory::default()
        };
        let (registry, _counters) = registry_with(factory, Vec::new());

        assert!(matches!(
            registry.register_module(ModuleInfo::new("bad")),
            Err(RegistryError::Configure { .. })
        ));
        assert!(registry.get_container_for(&m("bad")).is_none());
    }

    #[test]
    fn failing_initial_module_tears_down_registered_ones() {
        let factory = TrackedFactory {
            fail_configure_for: Some(m("bad")),
            ..TrackedFactory::default()
        };
        let counters = Arc::clone(&factory.counters);
        let result = ModuleRegistry::new(
            Arc::new(Container::new("global")),
            Arc::new(factory),
            &vec![ModuleInfo::new("good"), ModuleInfo::new("bad")],
        );

        assert!(result.is_err());
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_containers_are_not_registered() {
        let (registry, counters) = registry_with(TrackedFactory::default(), Vec::new());

        let transient = registry
            .create_transient_container(&AnalysisConfiguration::default())
            .unwrap();

        assert!(transient.is_transient());
        assert_eq!(transient.state(), ContainerState::Started);
        assert!(registry.is_empty());
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        transient.stop().unwrap();
    }

    #[test]
    fn stop_all_continues_past_failures() {
        let factory = TrackedFactory {
            fail_stop_for: Some(m("m2")),
            ..TrackedFactory::default()
        };
        let (registry, counters) = registry_with(
            factory,
            vec![ModuleInfo::new("m1"), ModuleInfo::new("m2"), ModuleInfo::new("m3")],
        );

        let err = registry.stop_all().unwrap_err();
        let RegistryError::StopAll { failed, source } = err else {
            panic!("expected StopAll");
        };
        assert_eq!(failed, 1);
        assert!(source.primary().to_string().contains("m2"));
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.global().state(), ContainerState::Stopped);
    }

    #[test]
    fn slow_start_does_not_block_unrelated_modules() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let factory = TrackedFactory {
            start_gate: Some((
                m("slow"),
                Arc::new(StartGate {
                    entered: Mutex::new(entered_tx),
                    release: Mutex::new(release_rx),
                }),
            )),
            ..TrackedFactory::default()
        };
        let others: Vec<ModuleInfo> = (0..64).map(|i| ModuleInfo::new(format!("other{i}"))).collect();
        let (registry, _counters) = registry_with(factory, others);
        let registry = Arc::new(registry);

        let slow = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.register_module(ModuleInfo::new("slow")))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let found = (0..64).all(|i| registry.get_container_for(&m(&format!("other{i}"))).is_some());
                let unregistered = registry.unregister_module(&m("other0")).unwrap();
                let registered = registry.register_module(ModuleInfo::new("fresh")).is_ok();
                let _ = done_tx.send(found && unregistered && registered);
            });
        }
        let unrelated = done_rx.recv_timeout(Duration::from_secs(5));
        release_tx.send(()).unwrap();

        assert_eq!(unrelated, Ok(true));
        let container = slow.join().unwrap().unwrap();
        assert_eq!(container.state(), ContainerState::Started);
        assert!(Arc::ptr_eq(&registry.get_container_for(&m("slow")).unwrap(), &container));
    }

    #[test]
    fn racing_register_and_unregister_never_double_stop() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;
        let (registry, counters) = registry_with(TrackedFactory::default(), Vec::new());
        let registry = Arc::new(registry);

        for _ in 0..ROUNDS {
            let barrier = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            registry.register_module(ModuleInfo::new("m1")).map(|_| ())
                        } else {
                            registry.unregister_module(&m("m1")).map(|_| ())
                        }
                    })
                })
                .collect();
            for handle in handles {
                // A second stop of one container would surface as AlreadyStopped.
                handle.join().unwrap().unwrap();
            }

            let started = counters.started.load(Ordering::SeqCst);
            let stopped = counters.stopped.load(Ordering::SeqCst);
            assert_eq!(started - stopped, u32::try_from(registry.len()).unwrap());
            if let Some(container) = registry.get_container_for(&m("m1")) {
                assert_eq!(container.state(), ContainerState::Started);
            }
        }

        registry.stop_all().unwrap();
        assert_eq!(
            counters.started.load(Ordering::SeqCst),
            counters.stopped.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn shut_down_registry_creates_no_containers() {
        let (registry, counters) = registry_with(TrackedFactory::default(), vec![ModuleInfo::new("m1")]);
        registry.stop_all().unwrap();
        assert!(registry.is_shut_down());

        assert!(matches!(
            registry.register_module(ModuleInfo::new("m2")),
            Err(RegistryError::ShutDown)
        ));
        assert!(matches!(
            registry.create_transient_container(&AnalysisConfiguration::default()),
            Err(RegistryError::ShutDown)
        ));
        assert!(registry.is_empty());
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }
}
