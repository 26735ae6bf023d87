//! Decision model: what happens to a task after a failed attempt.
//!
//! Deciders are pure: given the task record, the failure and the queue's retry
//! settings they return the next action. Applying it (the store transition)
//! is the caller's job.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::retry::{RetryPolicy, add_saturating};
use crate::domain::{ErrorDetail, ErrorKind, Task};

/// The next action for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back to `PENDING`, eligible again at `scheduled_at`.
    Requeue {
        scheduled_at: DateTime<Utc>,
        delay: Duration,
        reason: String,
    },

    /// Terminal `FAILED`.
    Fail { reason: String },

    /// Terminal `EXPIRED`: the retry would land past the pending-age deadline.
    Expire { reason: String },
}

impl RetryDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RetryDecision::Requeue { .. } => "requeue",
            RetryDecision::Fail { .. } => "fail",
            RetryDecision::Expire { .. } => "expire",
        }
    }
}

/// Inputs for one decision.
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub task: &'a Task,
    pub failure: &'a ErrorDetail,
    pub policy: &'a RetryPolicy,
    pub max_pending_age: Duration,
    pub now: DateTime<Utc>,
}

pub trait Decider: Send + Sync {
    fn decide(&self, input: &DecisionInput<'_>) -> RetryDecision;
}

/// Attempt-based retry with deterministic backoff:
/// - permanent failures are not retried
/// - `attempts >= max_attempts` fails the task
/// - otherwise requeue at `last_attempt_at + next_delay(attempts)`, unless
///   that is past `now + max_pending_age` (the requeue restarts the pending
///   clock, so time spent executing never counts against it)
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, input: &DecisionInput<'_>) -> RetryDecision {
        let task = input.task;

        if input.failure.kind == ErrorKind::Permanent {
            return RetryDecision::Fail {
                reason: format!("permanent failure: {}", input.failure.message),
            };
        }

        if task.attempts >= task.max_attempts {
            return RetryDecision::Fail {
                reason: format!(
                    "max attempts reached: {}/{}",
                    task.attempts, task.max_attempts
                ),
            };
        }

        let delay = input.policy.next_delay(task.attempts);
        let base = task.last_attempt_at.unwrap_or(input.now);
        let scheduled_at = add_saturating(base, delay);
        let deadline = add_saturating(input.now, input.max_pending_age);

        if scheduled_at > deadline {
            return RetryDecision::Expire {
                reason: format!("retry at {scheduled_at} is past pending deadline {deadline}"),
            };
        }

        RetryDecision::Requeue {
            scheduled_at,
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                task.attempts + 1,
                task.max_attempts,
                delay
            ),
        }
    }
}
