//! Resolves a command to a container, runs it, and cleans up.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use lintd_core::{is_cancellation, CompositeError, ProgressMonitor};
use tracing::{debug, error};

use super::analysis::AnalysisConfiguration;
use crate::container::{Container, ContainerError};
use crate::module::{ModuleId, ModuleRegistry, RegistryError};

/// A command that runs inside a container.
pub trait ContainerCommand {
    type Output;

    /// Registered module to run in. `None`, or an id that is not registered,
    /// runs the command in a transient container instead.
    fn target_module(&self) -> Option<&ModuleId>;

    /// Input used to build the transient container.
    fn transient_input(&self) -> &AnalysisConfiguration;

    /// Does the work. Returns [`Canceled`](lintd_core::Canceled) (possibly
    /// wrapped in context) when `progress` was canceled.
    ///
    /// # Errors
    ///
    /// Any failure of the work itself.
    fn run(&mut self, container: &Container, progress: &ProgressMonitor) -> anyhow::Result<Self::Output>;
}

/// Errors returned by command execution.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The command observed cancellation. Not a failure.
    #[error("command canceled")]
    Canceled,
    #[error("failed to create transient container: {0}")]
    TransientContainer(#[source] RegistryError),
    /// The command itself failed.
    #[error("command failed: {0}")]
    Execution(#[source] anyhow::Error),
    /// Stopping the transient container failed. If the command failed too,
    /// its error is attached as suppressed.
    #[error("container teardown failed: {0}")]
    Teardown(#[source] CompositeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DispatchError {
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Runs `command` in its module container, or in a fresh transient container
/// that is stopped before returning whatever the outcome.
///
/// # Errors
///
/// * [`DispatchError::Canceled`] if `progress` was canceled before starting
///   or the command returned a cancellation.
/// * [`DispatchError::Execution`] if the command failed.
/// * [`DispatchError::Teardown`] if stopping the transient container failed,
///   with the command's error (if any) attached as suppressed.
///
/// # Panics
///
/// Re-raises a panic of the command once the transient container is stopped.
pub fn execute<C: ContainerCommand>(
    command: &mut C,
    registry: &ModuleRegistry,
    progress: &ProgressMonitor,
) -> Result<C::Output, DispatchError> {
    if progress.is_canceled() {
        return Err(DispatchError::Canceled);
    }

    let registered = command
        .target_module()
        .and_then(|id| registry.get_container_for(id));
    let container = match registered {
        Some(container) => container,
        None => {
            if let Some(id) = command.target_module() {
                debug!(module = %id, "module not registered, using a transient container");
            }
            registry
                .create_transient_container(command.transient_input())
                .map_err(DispatchError::TransientContainer)?
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| command.run(&container, progress)));
    let teardown = if container.is_transient() {
        container.stop().err()
    } else {
        None
    };
    match outcome {
        Ok(outcome) => compose(outcome, teardown),
        Err(panic) => {
            if let Some(stop_err) = teardown {
                error!(container = container.name(), error = %stop_err, "teardown after panicking command failed");
            }
            resume_unwind(panic)
        }
    }
}

fn compose<T>(outcome: anyhow::Result<T>, teardown: Option<ContainerError>) -> Result<T, DispatchError> {
    match (outcome, teardown) {
        (Ok(value), None) => Ok(value),
        (Err(err), None) if is_cancellation(&err) => {
            debug!(error = %err, "command canceled");
            Err(DispatchError::Canceled)
        }
        (Err(err), None) => Err(DispatchError::Execution(err)),
        (Ok(_), Some(stop_err)) => Err(DispatchError::Teardown(CompositeError::new(stop_err.into()))),
        (Err(err), Some(stop_err)) => Err(DispatchError::Teardown(
            CompositeError::new(stop_err.into()).with_suppressed(err),
        )),
    }
}
