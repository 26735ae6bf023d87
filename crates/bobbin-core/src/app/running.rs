//! Registry of attempts currently executing, keyed by task.
//!
//! Each entry carries a signal channel into the execution unit (cancel or
//! abort) and a completion flag the canceller can wait on. Entries are tagged
//! with the attempt number so a late signal never reaches a newer attempt.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

use crate::domain::TaskId;

/// Instruction from the engine to an execution unit. Only ever escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunSignal {
    Run,
    /// Cooperative cancel with a grace period.
    Cancel,
    /// Stop now; the task state has already been settled elsewhere.
    Abort,
}

struct RunHandle {
    attempt: u32,
    signal: watch::Sender<RunSignal>,
    done: watch::Receiver<bool>,
}

/// The execution unit's half of a registration.
#[derive(Debug)]
pub struct RunTicket {
    pub task_id: TaskId,
    pub attempt: u32,
    pub signal: watch::Receiver<RunSignal>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
pub struct RunningRegistry {
    runs: Mutex<HashMap<TaskId, RunHandle>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: TaskId, attempt: u32) -> RunTicket {
        let (signal_tx, signal_rx) = watch::channel(RunSignal::Run);
        let (done_tx, done_rx) = watch::channel(false);
        self.lock().insert(
            task_id,
            RunHandle {
                attempt,
                signal: signal_tx,
                done: done_rx,
            },
        );
        RunTicket {
            task_id,
            attempt,
            signal: signal_rx,
            done: done_tx,
        }
    }

    /// Escalates the signal of the current attempt of `task_id`. When
    /// `attempt` is given, only that attempt is signalled.
    ///
    /// Returns a receiver that flips to `true` once the unit has finished, or
    /// `None` when nothing matching is running.
    pub fn signal(
        &self,
        task_id: TaskId,
        attempt: Option<u32>,
        sig: RunSignal,
    ) -> Option<watch::Receiver<bool>> {
        let runs = self.lock();
        let handle = runs.get(&task_id)?;
        if attempt.is_some_and(|a| a != handle.attempt) {
            return None;
        }
        handle.signal.send_if_modified(|current| {
            if sig > *current {
                *current = sig;
                true
            } else {
                false
            }
        });
        Some(handle.done.clone())
    }

    /// Unregisters the ticket's attempt and wakes anyone waiting on it.
    pub fn finish(&self, ticket: RunTicket) {
        {
            let mut runs = self.lock();
            if runs.get(&ticket.task_id).is_some_and(|h| h.attempt == ticket.attempt) {
                runs.remove(&ticket.task_id);
            }
        }
        ticket.done.send_replace(true);
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.lock().contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, RunHandle>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
