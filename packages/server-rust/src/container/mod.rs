//! Lifecycle-managed component containers.
//!
//! A [`Container`] is a typed bag of components with a one-shot lifecycle
//! (`Created -> Started -> Stopped`). Components are started in registration
//! order and stopped in reverse. Lookups fall back to the parent container, so
//! a module container sees the global container's components but never the
//! other way round.

mod analyzer;

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use lintd_core::CompositeError;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

pub use analyzer::{AnalysisCapability, ModuleAnalyzer};

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A lifecycle-managed capability held by a [`Container`].
///
/// The `Any` bound enables type-based lookup via [`Container::lookup`].
pub trait Component: Send + Sync + Any {
    /// Short name used in logs (e.g., `"analyzer"`, `"settings"`).
    fn name(&self) -> &'static str;

    /// Called once when the owning container starts.
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the owning container stops, in reverse start order.
    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs after every component started. Used by collaborators to index files
/// before the container executes anything.
pub type PostStartHook = Box<dyn FnOnce(&Container) -> anyhow::Result<()> + Send>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by container operations.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container '{name}' already started")]
    AlreadyStarted { name: String },
    #[error("container '{name}' already stopped")]
    AlreadyStopped { name: String },
    #[error("no component of type {type_name} in container '{name}' or its parents")]
    NotFound {
        name: String,
        type_name: &'static str,
    },
    #[error("container '{name}' failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: CompositeError,
    },
    #[error("container '{name}' teardown failed: {source}")]
    TeardownFailed {
        name: String,
        #[source]
        source: CompositeError,
    },
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Started,
    Stopped,
}

/// Typed, lifecycle-managed bag of components with optional parent fallback.
pub struct Container {
    name: String,
    transient: bool,
    parent: Option<Arc<Container>>,
    /// Registration order for deterministic start/stop sequencing.
    components: RwLock<Vec<Arc<dyn Component>>>,
    /// Type-based lookup: `TypeId` -> `Arc<dyn Any + Send + Sync>`.
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    state: Mutex<ContainerState>,
    post_start: Mutex<Option<PostStartHook>>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("transient", &self.transient)
            .field("state", &*self.state.lock())
            .field("components", &self.components.read().len())
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl Container {
    /// Creates an empty, persistent root container.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false, None)
    }

    /// Creates a persistent container whose lookups fall back to `self`.
    #[must_use]
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Self {
        Self::build(name.into(), false, Some(Arc::clone(self)))
    }

    /// Creates a transient container whose lookups fall back to `self`.
    /// Transient containers live for a single command.
    #[must_use]
    pub fn transient_child(self: &Arc<Self>, name: impl Into<String>) -> Self {
        Self::build(name.into(), true, Some(Arc::clone(self)))
    }

    fn build(name: String, transient: bool, parent: Option<Arc<Container>>) -> Self {
        Self {
            name,
            transient,
            parent,
            components: RwLock::new(Vec::new()),
            by_type: DashMap::new(),
            state: Mutex::new(ContainerState::Created),
            post_start: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    #[must_use]
    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Container>> {
        self.parent.as_ref()
    }

    fn ensure_created(&self) -> Result<(), ContainerError> {
        match *self.state.lock() {
            ContainerState::Created => Ok(()),
            ContainerState::Started => Err(ContainerError::AlreadyStarted {
                name: self.name.clone(),
            }),
            ContainerState::Stopped => Err(ContainerError::AlreadyStopped {
                name: self.name.clone(),
            }),
        }
    }

    /// Registers a component. Registration order determines start/stop
    /// sequencing; a later component of the same type shadows an earlier one
    /// for lookups.
    ///
    /// # Errors
    ///
    /// Fails once the container has started or stopped.
    pub fn add<T: Component>(&self, component: T) -> Result<Arc<T>, ContainerError> {
        let arc = Arc::new(component);
        self.add_shared(Arc::clone(&arc))?;
        Ok(arc)
    }

    /// Registers an already shared component.
    ///
    /// # Errors
    ///
    /// Fails once the container has started or stopped.
    pub fn add_shared<T: Component>(&self, component: Arc<T>) -> Result<(), ContainerError> {
        self.ensure_created()?;
        self.by_type
            .insert(TypeId::of::<T>(), Arc::clone(&component) as Arc<dyn Any + Send + Sync>);
        self.components.write().push(component);
        Ok(())
    }

    /// Sets the hook run at the end of [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Fails once the container has started or stopped.
    pub fn set_post_start(&self, hook: PostStartHook) -> Result<(), ContainerError> {
        self.ensure_created()?;
        *self.post_start.lock() = Some(hook);
        Ok(())
    }

    /// Retrieves a component by concrete type, searching this container first
    /// and then each parent.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let local = self
            .by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok());
        match local {
            Some(found) => Some(found),
            None => self.parent.as_ref().and_then(|parent| parent.get::<T>()),
        }
    }

    /// Like [`get`](Self::get), but absence is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NotFound`] if neither this container nor any
    /// parent holds a `T`.
    pub fn lookup<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContainerError> {
        self.get::<T>().ok_or_else(|| ContainerError::NotFound {
            name: self.name.clone(),
            type_name: type_name::<T>(),
        })
    }

    /// Starts every component in registration order, then runs the post-start
    /// hook.
    ///
    /// On failure, components already started are stopped in reverse order
    /// and the container ends up stopped.
    ///
    /// # Errors
    ///
    /// [`ContainerError::AlreadyStarted`] / [`ContainerError::AlreadyStopped`]
    /// on a second call, [`ContainerError::StartFailed`] if a component or the
    /// hook fails (teardown errors from the rollback are attached as
    /// suppressed).
    pub fn start(&self) -> Result<(), ContainerError> {
        {
            let mut state = self.state.lock();
            match *state {
                ContainerState::Created => *state = ContainerState::Started,
                ContainerState::Started => {
                    return Err(ContainerError::AlreadyStarted {
                        name: self.name.clone(),
                    })
                }
                ContainerState::Stopped => {
                    return Err(ContainerError::AlreadyStopped {
                        name: self.name.clone(),
                    })
                }
            }
        }

        let components = self.components.read().clone();
        let mut started = 0;
        let mut failure = None;
        for component in &components {
            if let Err(err) = component.start() {
                failure = Some(err.context(format!("component '{}' failed to start", component.name())));
                break;
            }
            started += 1;
        }
        if failure.is_none() {
            let hook = self.post_start.lock().take();
            if let Some(hook) = hook {
                if let Err(err) = hook(self) {
                    failure = Some(err.context("post-start hook failed"));
                }
            }
        }

        let Some(err) = failure else {
            debug!(container = %self.name, components = components.len(), "container started");
            return Ok(());
        };

        warn!(container = %self.name, error = %err, "container start failed, rolling back");
        let mut composite = CompositeError::new(err);
        for teardown in stop_in_reverse(&components[..started]) {
            composite.add_suppressed(teardown);
        }
        *self.state.lock() = ContainerState::Stopped;
        Err(ContainerError::StartFailed {
            name: self.name.clone(),
            source: composite,
        })
    }

    /// Stops every component in reverse registration order, continuing past
    /// failures. Stopping a container that never started stops nothing.
    ///
    /// # Errors
    ///
    /// [`ContainerError::AlreadyStopped`] on a second call,
    /// [`ContainerError::TeardownFailed`] carrying every component failure.
    pub fn stop(&self) -> Result<(), ContainerError> {
        let was_started = {
            let mut state = self.state.lock();
            match *state {
                ContainerState::Stopped => {
                    return Err(ContainerError::AlreadyStopped {
                        name: self.name.clone(),
                    })
                }
                previous => {
                    *state = ContainerState::Stopped;
                    previous == ContainerState::Started
                }
            }
        };
        if !was_started {
            debug!(container = %self.name, "stopping container that never started");
            return Ok(());
        }

        let components = self.components.read().clone();
        let errors = stop_in_reverse(&components);
        match CompositeError::from_errors(errors) {
            None => {
                debug!(container = %self.name, transient = self.transient, "container stopped");
                Ok(())
            }
            Some(composite) => Err(ContainerError::TeardownFailed {
                name: self.name.clone(),
                source: composite,
            }),
        }
    }
}

fn stop_in_reverse(components: &[Arc<dyn Component>]) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for component in components.iter().rev() {
        if let Err(err) = component.stop() {
            warn!(component = component.name(), error = %err, "component failed to stop");
            errors.push(err.context(format!("component '{}' failed to stop", component.name())));
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
