//! Priority queue of pending engine commands.

use std::collections::BTreeMap;
use std::time::Instant;

use lintd_core::ProgressMonitor;

use super::EngineError;
use crate::command::{AnalysisKey, CommandKind};
use crate::module::{ModuleId, ModuleRegistry};

/// Type-erased command plus its reply channel.
pub(crate) trait Job: Send {
    /// Executes the command and delivers its outcome.
    fn run(self: Box<Self>, registry: &ModuleRegistry, progress: &ProgressMonitor);

    /// Delivers `err` without executing.
    fn reject(self: Box<Self>, err: EngineError);
}

pub(crate) struct QueuedCommand {
    pub(crate) id: u64,
    pub(crate) kind: CommandKind,
    pub(crate) module: Option<ModuleId>,
    pub(crate) analysis_key: Option<AnalysisKey>,
    pub(crate) enqueued_at: Instant,
    pub(crate) progress: ProgressMonitor,
    pub(crate) job: Box<dyn Job>,
}

impl QueuedCommand {
    /// Cancels the command's progress and resolves it as canceled.
    pub(crate) fn cancel(self) {
        self.progress.cancel();
        self.job.reject(EngineError::Canceled);
    }
}

/// Commands ordered by `(priority, id)`: lower priority first, FIFO within a
/// priority since ids increase monotonically.
#[derive(Default)]
pub(crate) struct CommandQueue {
    entries: BTreeMap<(u8, u64), QueuedCommand>,
}

impl CommandQueue {
    pub(crate) fn push(&mut self, command: QueuedCommand) {
        self.entries
            .insert((command.kind.priority(), command.id), command);
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedCommand> {
        self.entries.pop_first().map(|(_, command)| command)
    }

    /// Removes and returns every command matching `predicate`, in queue order.
    pub(crate) fn remove_where(
        &mut self,
        mut predicate: impl FnMut(&QueuedCommand) -> bool,
    ) -> Vec<QueuedCommand> {
        let keys: Vec<(u8, u64)> = self
            .entries
            .iter()
            .filter(|(_, command)| predicate(command))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<QueuedCommand> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
