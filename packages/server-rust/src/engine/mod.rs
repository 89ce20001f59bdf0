//! Sequential analysis engine.
//!
//! Commands are posted to a priority queue and executed one at a time by a
//! single worker task, each on tokio's blocking pool. Every post returns a
//! [`CommandHandle`] resolving to the command's outcome.

mod queue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lintd_core::ProgressMonitor;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::analysis::{AnalysisResults, ModuleFileEvent};
use crate::command::{
    instrument, AnalyzeCommand, Command, CommandKind, DispatchError, NotifyModuleEventCommand,
    RegisterModuleCommand, UnregisterModuleCommand,
};
use crate::config::EngineConfig;
use crate::module::{ModuleId, ModuleInfo, ModuleRegistry, RegistryError};

use queue::{CommandQueue, Job, QueuedCommand};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Outcome of a posted command other than success.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is stopped")]
    Stopped,
    #[error("command canceled")]
    Canceled,
    #[error("command was dropped before completing")]
    Aborted,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("engine shutdown failed: {0}")]
    Shutdown(#[source] RegistryError),
}

// ---------------------------------------------------------------------------
// CommandHandle
// ---------------------------------------------------------------------------

/// Handle to a posted command.
pub struct CommandHandle<T> {
    rx: oneshot::Receiver<Result<T, EngineError>>,
    progress: ProgressMonitor,
}

impl<T> CommandHandle<T> {
    /// The progress monitor the command runs with.
    #[must_use]
    pub fn progress(&self) -> &ProgressMonitor {
        &self.progress
    }

    /// Requests cancellation. A queued command is resolved as canceled
    /// without running; a running one is signaled through its progress.
    pub fn cancel(&self) {
        self.progress.cancel();
    }

    /// Waits for the command's outcome.
    ///
    /// # Errors
    ///
    /// [`EngineError::Canceled`] if the command was canceled (before or while
    /// running), [`EngineError::Stopped`] if it was posted after
    /// [`AnalysisEngine::stop`], [`EngineError::Dispatch`] if it failed.
    pub async fn join(self) -> Result<T, EngineError> {
        self.rx.await.unwrap_or(Err(EngineError::Aborted))
    }
}

// ---------------------------------------------------------------------------
// Job implementation
// ---------------------------------------------------------------------------

struct PendingCommand<C: Command> {
    command: C,
    reply: oneshot::Sender<Result<C::Output, EngineError>>,
}

impl<C: Command> Job for PendingCommand<C> {
    fn run(self: Box<Self>, registry: &ModuleRegistry, progress: &ProgressMonitor) {
        let Self { command, reply } = *self;
        let result = if progress.is_canceled() {
            Err(EngineError::Canceled)
        } else {
            let kind = command.kind();
            let module = command.module_id().cloned();
            match instrument(kind, module.as_ref(), || command.execute(registry, progress)) {
                Ok(_) if progress.is_canceled() => Err(EngineError::Canceled),
                Ok(output) => Ok(output),
                Err(DispatchError::Canceled) => Err(EngineError::Canceled),
                Err(err) => {
                    error!(kind = kind.as_str(), module = ?module, error = %err, "command failed");
                    Err(EngineError::Dispatch(err))
                }
            }
        };
        // The caller may have dropped its handle.
        let _ = reply.send(result);
    }

    fn reject(self: Box<Self>, err: EngineError) {
        let _ = self.reply.send(Err(err));
    }
}

// ---------------------------------------------------------------------------
// AnalysisEngine
// ---------------------------------------------------------------------------

struct Executing {
    id: u64,
    module: Option<ModuleId>,
    progress: ProgressMonitor,
}

struct Inner {
    config: EngineConfig,
    registry: Arc<ModuleRegistry>,
    queue: Mutex<CommandQueue>,
    wakeup: Notify,
    executing: Mutex<Option<Executing>>,
    /// Only written while holding `queue`, so a post either lands before the
    /// shutdown drain or is rejected.
    stopped: AtomicBool,
    next_id: AtomicU64,
}

/// Single-worker command executor over a [`ModuleRegistry`].
pub struct AnalysisEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisEngine {
    /// Spawns the engine worker on the current tokio runtime.
    #[must_use]
    pub fn start(config: EngineConfig, registry: Arc<ModuleRegistry>) -> Self {
        let inner = Arc::new(Inner {
            config,
            registry,
            queue: Mutex::new(CommandQueue::default()),
            wakeup: Notify::new(),
            executing: Mutex::new(None),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });
        let handle = tokio::spawn(run_worker(Arc::clone(&inner)));
        info!(worker = %inner.config.worker_name, "analysis engine started");
        Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.inner.registry
    }

    /// Queues `command`. After [`stop`](Self::stop) the handle resolves to
    /// [`EngineError::Stopped`].
    ///
    /// A command carrying an [`analysis_key`](Command::analysis_key) cancels
    /// queued commands with the same key.
    pub fn post<C: Command>(&self, command: C, progress: ProgressMonitor) -> CommandHandle<C::Output> {
        let (reply, rx) = oneshot::channel();
        let handle = CommandHandle {
            rx,
            progress: progress.clone(),
        };
        let entry = QueuedCommand {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            kind: command.kind(),
            module: command.module_id().cloned(),
            analysis_key: command.analysis_key(),
            enqueued_at: Instant::now(),
            progress,
            job: Box::new(PendingCommand { command, reply }),
        };

        {
            let mut queue = self.inner.queue.lock();
            if self.inner.stopped.load(Ordering::Acquire) {
                drop(queue);
                debug!(kind = entry.kind.as_str(), "rejecting command posted after stop");
                entry.job.reject(EngineError::Stopped);
                return handle;
            }
            if let Some(key) = &entry.analysis_key {
                for superseded in queue.remove_where(|queued| queued.analysis_key.as_ref() == Some(key)) {
                    debug!(command = superseded.id, by = entry.id, "queued analysis superseded");
                    superseded.cancel();
                }
            }
            debug!(command = entry.id, kind = entry.kind.as_str(), pending = queue.len(), "command queued");
            queue.push(entry);
        }
        self.inner.wakeup.notify_one();
        handle
    }

    /// Queues the registration of `module`.
    pub fn register_module(&self, module: ModuleInfo) -> CommandHandle<()> {
        self.post(RegisterModuleCommand::new(module), ProgressMonitor::detached())
    }

    /// Cancels queued commands targeting `module` and the running one if it
    /// targets it, then queues the unregistration.
    pub fn unregister_module(&self, module: ModuleId) -> CommandHandle<bool> {
        let canceled = self
            .inner
            .queue
            .lock()
            .remove_where(|queued| queued.module.as_ref() == Some(&module));
        for command in canceled {
            debug!(command = command.id, module = %module, "canceling command of unregistered module");
            command.cancel();
        }
        if let Some(executing) = self.inner.executing.lock().as_ref() {
            if executing.module.as_ref() == Some(&module) {
                debug!(command = executing.id, module = %module, "canceling running command of unregistered module");
                executing.progress.cancel();
            }
        }
        self.post(UnregisterModuleCommand::new(module), ProgressMonitor::detached())
    }

    /// Queues a file event for a registered module.
    pub fn notify_module_event(&self, module: ModuleId, event: ModuleFileEvent) -> CommandHandle<bool> {
        self.post(
            NotifyModuleEventCommand::new(module, event),
            ProgressMonitor::detached(),
        )
    }

    /// Queues an analysis.
    pub fn analyze(&self, command: AnalyzeCommand, progress: ProgressMonitor) -> CommandHandle<AnalysisResults> {
        self.post(command, progress)
    }

    /// Rejects further posts, cancels pending and running commands, waits for
    /// the worker, then stops every container. Idempotent.
    ///
    /// # Errors
    ///
    /// [`EngineError::Shutdown`] if containers failed to stop.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let pending = {
            let mut queue = self.inner.queue.lock();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            queue.drain()
        };
        info!(pending = pending.len(), "stopping analysis engine");
        for command in pending {
            command.cancel();
        }
        if let Some(executing) = self.inner.executing.lock().as_ref() {
            executing.progress.cancel();
        }
        self.inner.wakeup.notify_one();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(err) = handle.await {
                error!(error = %err, "engine worker panicked");
            }
        }

        let registry = Arc::clone(&self.inner.registry);
        match tokio::task::spawn_blocking(move || registry.stop_all()).await {
            Ok(Ok(())) => {
                info!("analysis engine stopped");
                Ok(())
            }
            Ok(Err(err)) => Err(EngineError::Shutdown(err)),
            Err(err) => {
                error!(error = %err, "registry shutdown panicked");
                Err(EngineError::Aborted)
            }
        }
    }
}

impl Drop for AnalysisEngine {
    fn drop(&mut self) {
        let pending = {
            let mut queue = self.inner.queue.lock();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.drain()
        };
        warn!(pending = pending.len(), "analysis engine dropped without stop, containers left running");
        for command in pending {
            command.cancel();
        }
        if let Some(executing) = self.inner.executing.lock().as_ref() {
            executing.progress.cancel();
        }
        self.inner.wakeup.notify_one();
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        let next = inner.queue.lock().pop();
        let Some(entry) = next else {
            if inner.stopped.load(Ordering::Acquire) {
                break;
            }
            inner.wakeup.notified().await;
            continue;
        };
        run_entry(&inner, entry).await;
    }
    debug!(worker = %inner.config.worker_name, "engine worker exited");
}

async fn run_entry(inner: &Arc<Inner>, entry: QueuedCommand) {
    if entry.kind == CommandKind::Analyze {
        let waited = entry.enqueued_at.elapsed();
        if waited > inner.config.analysis_expiration {
            debug!(command = entry.id, waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX), "analysis expired in queue");
            entry.cancel();
            return;
        }
    }

    let QueuedCommand {
        id,
        module,
        progress,
        job,
        ..
    } = entry;
    *inner.executing.lock() = Some(Executing {
        id,
        module,
        progress: progress.clone(),
    });

    let registry = Arc::clone(&inner.registry);
    let joined = tokio::task::spawn_blocking(move || job.run(&registry, &progress)).await;
    *inner.executing.lock() = None;

    if let Err(err) = joined {
        // The reply sender was dropped with the job; the handle sees Aborted.
        error!(command = id, error = %err, "command panicked");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
