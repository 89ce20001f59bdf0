//! Commands executed against the module registry.
//!
//! [`Command`] is what the engine queues. Commands that run inside a
//! container implement [`ContainerCommand`] and go through
//! [`dispatch::execute`], which resolves the container and owns the cleanup of
//! transient ones.

pub mod analysis;
mod analyze;
pub mod dispatch;
mod lifecycle;
mod notify;

use std::time::Instant;

use lintd_core::ProgressMonitor;
use tracing::{debug, info_span};

use crate::module::{ModuleId, ModuleRegistry};

pub use analysis::AnalysisKey;
pub use analyze::AnalyzeCommand;
pub use dispatch::{execute, ContainerCommand, DispatchError};
pub use lifecycle::{RegisterModuleCommand, UnregisterModuleCommand};
pub use notify::NotifyModuleEventCommand;

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// Command categories, ordered by scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    RegisterModule,
    UnregisterModule,
    NotifyModuleEvent,
    Analyze,
}

impl CommandKind {
    /// Lower runs first: module lifecycle, then file events, then analyses.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::RegisterModule | Self::UnregisterModule => 0,
            Self::NotifyModuleEvent => 1,
            Self::Analyze => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterModule => "register_module",
            Self::UnregisterModule => "unregister_module",
            Self::NotifyModuleEvent => "notify_module_event",
            Self::Analyze => "analyze",
        }
    }
}

// ---------------------------------------------------------------------------
// Command trait
// ---------------------------------------------------------------------------

/// A unit of work executed by the engine against the registry.
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> CommandKind;

    /// Module the command targets, if any. Unregistering that module cancels
    /// the command.
    fn module_id(&self) -> Option<&ModuleId> {
        None
    }

    /// For automatic analyses: identity under which a newer command
    /// supersedes this one while it is still queued.
    fn analysis_key(&self) -> Option<AnalysisKey> {
        None
    }

    /// Runs the command on the calling thread.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; cancellation is [`DispatchError::Canceled`].
    fn execute(
        self,
        registry: &ModuleRegistry,
        progress: &ProgressMonitor,
    ) -> Result<Self::Output, DispatchError>;
}

/// Runs `f` inside a `command` span recording its duration and outcome.
pub fn instrument<T>(
    kind: CommandKind,
    module: Option<&ModuleId>,
    f: impl FnOnce() -> Result<T, DispatchError>,
) -> Result<T, DispatchError> {
    let span = info_span!(
        "command",
        kind = kind.as_str(),
        module = module.map(tracing::field::display),
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let _entered = span.enter();

    let start = Instant::now();
    let result = f();
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let outcome = match &result {
        Ok(_) => "ok",
        Err(DispatchError::Canceled) => "canceled",
        Err(_) => "error",
    };

    span.record("duration_ms", duration_ms);
    span.record("outcome", outcome);
    debug!(duration_ms, outcome, "command finished");
    result
}
