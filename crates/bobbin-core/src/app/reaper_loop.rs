//! ReaperLoop - 放置されたタスクの回収
//!
//! # フロー（1 sweep）
//! 1. `list_live()` で非終端タスクを取得
//! 2. 実行中でハートビートが途絶えたもの → HeartbeatTimeout として失敗処理
//! 3. 実行中で max_runtime を超えたもの → RuntimeExceeded として失敗処理
//! 4. PENDING に入ってから max_pending_age を超えたもの → EXPIRED（attempt は消費しない）
//!
//! 失敗処理で状態を確定させてから実行ユニットに Abort を送る。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::engine::Shared;
use super::running::RunSignal;
use super::settle::{AttemptFailure, pending_deadline};
use crate::domain::{
    ErrorDetail, ErrorKind, FailureCause, SchedulerError, Task, TaskId, TaskState, TransitionPatch,
};
use crate::queue::QueueConfig;
use crate::queue::retry::to_chrono;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub heartbeat_timeouts: Vec<TaskId>,
    pub runtime_exceeded: Vec<TaskId>,
    pub expired: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.heartbeat_timeouts.is_empty() && self.runtime_exceeded.is_empty() && self.expired.is_empty()
    }
}

#[derive(Clone)]
pub struct Reaper {
    shared: Arc<Shared>,
}

impl Reaper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn sweep(&self) -> Result<SweepReport, SchedulerError> {
        let mut report = SweepReport::default();
        let now = self.shared.clock.now();

        for task in self.shared.store.list_live().await? {
            let config = self
                .shared
                .queues
                .get(&task.queue)
                .unwrap_or_else(|| QueueConfig::new(task.queue.clone(), task.kind));

            match task.state {
                TaskState::Pending => {
                    if now > pending_deadline(&task, &config) && self.expire(&task).await? {
                        report.expired.push(task.id);
                    }
                }
                TaskState::Admitted | TaskState::Running | TaskState::Checkpointed => {
                    let last_beat = task
                        .last_heartbeat_at
                        .or(task.last_attempt_at)
                        .unwrap_or(task.enqueued_at);
                    let silent = now - last_beat;
                    if silent > to_chrono(config.heartbeat_timeout()) {
                        let failure = AttemptFailure {
                            cause: FailureCause::HeartbeatTimeout,
                            kind: ErrorKind::Transient,
                            message: SchedulerError::HeartbeatTimeout {
                                id: task.id,
                                silent_ms: silent.num_milliseconds(),
                            }
                            .to_string(),
                        };
                        if self.fail(&task, failure).await? {
                            report.heartbeat_timeouts.push(task.id);
                        }
                        continue;
                    }

                    let started = task.last_attempt_at.unwrap_or(task.enqueued_at);
                    if let Some(max) = config.max_runtime()
                        && now - started > to_chrono(max)
                    {
                        let failure = AttemptFailure {
                            cause: FailureCause::RuntimeExceeded,
                            kind: ErrorKind::Transient,
                            message: format!("attempt exceeded max runtime of {max:?}"),
                        };
                        if self.fail(&task, failure).await? {
                            report.runtime_exceeded.push(task.id);
                        }
                    }
                }
                _ => {}
            }
        }

        if !report.is_empty() {
            info!(
                heartbeat_timeouts = report.heartbeat_timeouts.len(),
                runtime_exceeded = report.runtime_exceeded.len(),
                expired = report.expired.len(),
                "reaper sweep recovered tasks"
            );
        }
        Ok(report)
    }

    async fn fail(&self, task: &Task, failure: AttemptFailure) -> Result<bool, SchedulerError> {
        warn!(task_id = %task.id, queue = %task.queue, cause = ?failure.cause, "{}", failure.message);
        let settled = self
            .shared
            .failures
            .handle(task.id, task.attempts, failure)
            .await?;
        if settled.is_some() {
            // unit (if any) must stop; its reservation is released on exit
            self.shared
                .running
                .signal(task.id, Some(task.attempts), RunSignal::Abort);
        }
        Ok(settled.is_some())
    }

    async fn expire(&self, task: &Task) -> Result<bool, SchedulerError> {
        let now = self.shared.clock.now();
        let detail = ErrorDetail::new(
            FailureCause::Expired,
            ErrorKind::Permanent,
            format!("pending since {} past max age", task.pending_since),
            task.attempts,
            now,
        );
        match self
            .shared
            .store
            .transition(
                task.id,
                TaskState::Pending,
                TaskState::Expired,
                // a requeue in between restarts the pending clock
                TransitionPatch::new(now).attempt(task.attempts).error_detail(detail),
            )
            .await
        {
            Ok(_) => {
                info!(task_id = %task.id, queue = %task.queue, "pending task expired");
                Ok(true)
            }
            // admitted, requeued or cancelled meanwhile
            Err(e) if e.is_stale() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub(crate) async fn reaper_loop(
    reaper: Reaper,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "reaper loop started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if let Err(e) = reaper.sweep().await {
            warn!(error = %e, "reaper sweep failed");
        }
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("reaper loop stopped");
}
