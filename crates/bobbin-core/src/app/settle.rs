//! Final-state routing for executing tasks.
//!
//! Completion, cancellation and failure all end an attempt with one
//! compare-and-set out of whatever executing state the task is in. A lost
//! race (`StaleState`) re-reads and plans again. If the task has moved on to
//! another attempt or left the executing states, nothing is written.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    ErrorDetail, ErrorKind, FailureCause, SchedulerError, Task, TaskId, TaskState, TransitionPatch,
};
use crate::ports::{Clock, TaskStore};
use crate::queue::retry::add_saturating;
use crate::queue::{Decider, DecisionInput, QueueConfig, QueueRegistry, RetryDecision};

/// Applies `plan` to the current record of `id` while `attempt` still owns it.
///
/// Returns the updated task, or `None` if ownership was lost.
pub(crate) async fn settle<F>(
    store: &dyn TaskStore,
    id: TaskId,
    attempt: u32,
    mut plan: F,
) -> Result<Option<Task>, SchedulerError>
where
    F: FnMut(&Task) -> (TaskState, TransitionPatch),
{
    loop {
        let current = store.get(id).await?;
        if current.attempts != attempt || !current.state.is_executing() {
            debug!(task_id = %id, attempt, state = %current.state, "attempt no longer owns task");
            return Ok(None);
        }
        let (next, patch) = plan(&current);
        match store.transition(id, current.state, next, patch.attempt(attempt)).await {
            Ok(task) => return Ok(Some(task)),
            Err(e) if e.is_stale() => continue,
            Err(e) => return Err(e),
        }
    }
}

/// What went wrong with one attempt.
#[derive(Debug, Clone)]
pub(crate) struct AttemptFailure {
    pub cause: FailureCause,
    pub kind: ErrorKind,
    pub message: String,
}

/// Routes failed attempts through the retry decider.
pub(crate) struct FailureHandler {
    pub store: Arc<dyn TaskStore>,
    pub queues: Arc<QueueRegistry>,
    pub decider: Arc<dyn Decider>,
    pub clock: Arc<dyn Clock>,
}

impl FailureHandler {
    pub async fn handle(
        &self,
        id: TaskId,
        attempt: u32,
        failure: AttemptFailure,
    ) -> Result<Option<Task>, SchedulerError> {
        settle(self.store.as_ref(), id, attempt, |task| self.plan(task, &failure)).await
    }

    fn plan(&self, task: &Task, failure: &AttemptFailure) -> (TaskState, TransitionPatch) {
        let now = self.clock.now();
        // a queue removed at runtime still gets default retry settings
        let config = self
            .queues
            .get(&task.queue)
            .unwrap_or_else(|| QueueConfig::new(task.queue.clone(), task.kind));
        let policy = config.retry_policy();
        let detail = ErrorDetail::new(
            failure.cause,
            failure.kind,
            failure.message.clone(),
            task.attempts,
            now,
        );

        let decision = self.decider.decide(&DecisionInput {
            task,
            failure: &detail,
            policy: &policy,
            max_pending_age: config.max_pending_age(),
            now,
        });

        match decision {
            RetryDecision::Requeue {
                scheduled_at,
                delay,
                reason,
            } => {
                info!(
                    task_id = %task.id,
                    queue = %task.queue,
                    attempts = task.attempts,
                    max_attempts = task.max_attempts,
                    cause = ?failure.cause,
                    error = %failure.message,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    policy = "retry_policy",
                    decision = "requeue",
                    "attempt failed, requeued"
                );
                (
                    TaskState::Pending,
                    TransitionPatch::new(now)
                        .scheduled_at(scheduled_at)
                        .last_error(detail),
                )
            }
            RetryDecision::Fail { reason } => {
                warn!(
                    task_id = %task.id,
                    queue = %task.queue,
                    attempts = task.attempts,
                    max_attempts = task.max_attempts,
                    cause = ?failure.cause,
                    error = %failure.message,
                    %reason,
                    policy = "retry_policy",
                    decision = "fail",
                    "task failed"
                );
                (
                    TaskState::Failed,
                    TransitionPatch::new(now)
                        .last_error(detail.clone())
                        .error_detail(detail),
                )
            }
            RetryDecision::Expire { reason } => {
                warn!(
                    task_id = %task.id,
                    queue = %task.queue,
                    attempts = task.attempts,
                    cause = ?failure.cause,
                    %reason,
                    policy = "retry_policy",
                    decision = "expire",
                    "task expired instead of retrying"
                );
                let expired = ErrorDetail::new(
                    FailureCause::Expired,
                    failure.kind,
                    format!("{reason} (last error: {})", failure.message),
                    task.attempts,
                    now,
                );
                (
                    TaskState::Expired,
                    TransitionPatch::new(now).last_error(detail).error_detail(expired),
                )
            }
        }
    }
}

/// Deadline after which a pending task expires, counted from when it last
/// entered `PENDING`.
pub(crate) fn pending_deadline(task: &Task, config: &QueueConfig) -> chrono::DateTime<chrono::Utc> {
    add_saturating(task.pending_since, config.max_pending_age())
}
