//! JobContext - 実行本体に渡すコンテキスト
//!
//! task id、キャンセル信号、進捗報告、チェックポイントの読み書きを提供する。

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::running::RunSignal;
use crate::domain::{JobPayload, SchedulerError, Task, TaskId, TaskState, TransitionPatch};
use crate::ports::{Clock, TaskStore};

#[derive(Clone)]
pub struct JobContext {
    task: Arc<Task>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    signal: watch::Receiver<RunSignal>,
    checkpointing: bool,
}

impl JobContext {
    pub(crate) fn new(
        task: Task,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        signal: watch::Receiver<RunSignal>,
        checkpointing: bool,
    ) -> Self {
        Self {
            task: Arc::new(task),
            store,
            clock,
            signal,
            checkpointing,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn queue(&self) -> &str {
        &self.task.queue
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.task.attempts
    }

    pub fn payload(&self) -> &JobPayload {
        &self.task.payload
    }

    /// Task record as it was when this attempt started.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Checkpoint left by an earlier attempt (or earlier in this one, as of
    /// the start of the attempt).
    pub fn resume_from(&self) -> Option<&serde_json::Value> {
        self.task.checkpoint.as_ref()
    }

    /// Progress at the start of this attempt.
    pub fn initial_progress(&self) -> u8 {
        self.task.progress
    }

    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpointing
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow() != RunSignal::Run
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.clone();
        // sender dropped means the unit is gone: treat as cancelled
        let _ = rx.wait_for(|s| *s != RunSignal::Run).await;
    }

    /// Progress heartbeat. Values below the current progress still refresh
    /// the heartbeat.
    ///
    /// `StaleAttempt` once the task has moved on to a later attempt.
    pub async fn report_progress(&self, progress: u8) -> Result<(), SchedulerError> {
        self.store
            .mark_progress(self.task.id, self.task.attempts, progress, None, self.clock.now())
            .await?;
        Ok(())
    }

    /// Persists a resumable checkpoint: `RUNNING -> CHECKPOINTED -> RUNNING`.
    pub async fn checkpoint(&self, progress: u8, state: serde_json::Value) -> Result<(), SchedulerError> {
        if !self.checkpointing {
            return Err(SchedulerError::validation(format!(
                "checkpointing is disabled for task {}",
                self.task.id
            )));
        }
        if progress > 100 {
            return Err(SchedulerError::validation(format!(
                "progress {progress} is out of range 0..=100"
            )));
        }

        let now = self.clock.now();
        self.store
            .transition(
                self.task.id,
                TaskState::Running,
                TaskState::Checkpointed,
                TransitionPatch::new(now)
                    .attempt(self.task.attempts)
                    .progress(progress)
                    .checkpoint(state),
            )
            .await?;
        self.store
            .transition(
                self.task.id,
                TaskState::Checkpointed,
                TaskState::Running,
                TransitionPatch::new(now).attempt(self.task.attempts),
            )
            .await?;
        debug!(task_id = %self.task.id, progress, "checkpoint stored");
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("task_id", &self.task.id)
            .field("attempt", &self.task.attempts)
            .field("checkpointing", &self.checkpointing)
            .finish()
    }
}
