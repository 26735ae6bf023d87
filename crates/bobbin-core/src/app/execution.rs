//! Execution unit: runs one attempt of one task.
//!
//! The job body runs as its own tokio task so the unit can keep listening for
//! cancel/abort signals while it works, and so a panicking body is observed
//! as a `JoinError` instead of taking the unit down with it.
//!
//! Whatever happens, the unit releases its reservation and global slot on the
//! way out, then unregisters from the running registry.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinError;
use tracing::{Instrument, debug, info, warn};

use super::context::JobContext;
use super::engine::Wakeups;
use super::running::{RunSignal, RunTicket, RunningRegistry};
use super::settle::{AttemptFailure, FailureHandler, settle};
use crate::domain::{
    ErrorDetail, ErrorKind, ExecutionFailure, FailureCause, Task, TaskState, TransitionPatch,
};
use crate::ledger::Reservation;
use crate::observability::attempt_span;
use crate::ports::{Clock, JobBody, TaskStore};

type BodyResult = Result<Result<serde_json::Value, ExecutionFailure>, JoinError>;

/// How the attempt ended, before it is written to the store.
enum Ending {
    /// The body returned (or panicked) on its own.
    Finished(BodyResult),
    /// Cancel requested; the body returned within the grace period.
    CancelledWithin(BodyResult),
    /// Cancel requested; the body overran the grace period and was aborted.
    ForcedCancel,
    /// The task was already settled by the reaper.
    Aborted,
}

pub(crate) struct ExecutionUnit {
    pub task: Task,
    pub body: Arc<dyn JobBody>,
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
    pub failures: Arc<FailureHandler>,
    pub running: Arc<RunningRegistry>,
    pub wakeups: Arc<Wakeups>,
    pub reservation: Reservation,
    pub permit: OwnedSemaphorePermit,
    pub ticket: RunTicket,
    pub cancel_grace: Duration,
    pub checkpointing: bool,
}

impl ExecutionUnit {
    pub async fn run(self) {
        let ExecutionUnit {
            task,
            body,
            store,
            clock,
            failures,
            running,
            wakeups,
            reservation,
            permit,
            ticket,
            cancel_grace,
            checkpointing,
        } = self;

        let id = task.id;
        let attempt = ticket.attempt;
        debug!(task_id = %id, queue = %task.queue, attempt, "execution started");

        let ctx = JobContext::new(
            task.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            ticket.signal.clone(),
            checkpointing,
        );
        let runner = Arc::clone(&body);
        let span = attempt_span(id, &task.queue, task.kind, attempt);
        let mut handle = tokio::spawn(async move { runner.execute(ctx).await }.instrument(span));
        let mut signal = ticket.signal.clone();

        let ending = loop {
            tokio::select! {
                joined = &mut handle => break Ending::Finished(joined),
                changed = signal.changed() => {
                    if changed.is_err() {
                        // registry dropped the sender; nothing else can arrive
                        break Ending::Finished((&mut handle).await);
                    }
                    let sig = *signal.borrow_and_update();
                    match sig {
                        RunSignal::Run => continue,
                        RunSignal::Cancel => {
                            info!(task_id = %id, grace_ms = cancel_grace.as_millis() as u64, "cancel requested");
                            body.on_cancel(&task).await;
                            match tokio::time::timeout(cancel_grace, &mut handle).await {
                                Ok(joined) => break Ending::CancelledWithin(joined),
                                Err(_) => {
                                    handle.abort();
                                    break Ending::ForcedCancel;
                                }
                            }
                        }
                        RunSignal::Abort => {
                            handle.abort();
                            break Ending::Aborted;
                        }
                    }
                }
            }
        };

        // a cancel that raced a natural finish still wins unless the body succeeded
        let ending = match ending {
            Ending::Finished(joined) if *ticket.signal.borrow() == RunSignal::Cancel => {
                Ending::CancelledWithin(joined)
            }
            other => other,
        };

        let outcome = match ending {
            Ending::Finished(Ok(Ok(value))) | Ending::CancelledWithin(Ok(Ok(value))) => {
                complete(store.as_ref(), clock.as_ref(), &task, attempt, value).await
            }
            Ending::Finished(Ok(Err(failure))) => {
                let failure = AttemptFailure {
                    cause: FailureCause::Execution,
                    kind: failure.kind,
                    message: failure.message,
                };
                failures.handle(id, attempt, failure).await
            }
            Ending::Finished(Err(join_err)) => {
                let failure = AttemptFailure {
                    cause: FailureCause::Panicked,
                    kind: ErrorKind::Transient,
                    message: format!("job body panicked: {join_err}"),
                };
                failures.handle(id, attempt, failure).await
            }
            Ending::CancelledWithin(_) | Ending::ForcedCancel => {
                cancel(store.as_ref(), clock.as_ref(), attempt, &task).await
            }
            Ending::Aborted => {
                debug!(task_id = %id, attempt, "execution aborted");
                Ok(None)
            }
        };

        if let Err(e) = outcome {
            warn!(task_id = %id, attempt, error = %e, "failed to record attempt outcome");
        }

        reservation.release();
        drop(permit);
        running.finish(ticket);
        wakeups.wake_all();
    }
}

async fn complete(
    store: &dyn TaskStore,
    clock: &dyn Clock,
    task: &Task,
    attempt: u32,
    value: serde_json::Value,
) -> Result<Option<Task>, crate::domain::SchedulerError> {
    let settled = settle(store, task.id, attempt, |_| {
        (
            TaskState::Completed,
            TransitionPatch::new(clock.now()).progress(100).result(value.clone()),
        )
    })
    .await?;
    if settled.is_some() {
        info!(task_id = %task.id, queue = %task.queue, attempt, "task completed");
    }
    Ok(settled)
}

async fn cancel(
    store: &dyn TaskStore,
    clock: &dyn Clock,
    attempt: u32,
    task: &Task,
) -> Result<Option<Task>, crate::domain::SchedulerError> {
    let settled = settle(store, task.id, attempt, |current| {
        let now = clock.now();
        let detail = ErrorDetail::new(
            FailureCause::Cancelled,
            ErrorKind::Permanent,
            "cancelled while running",
            current.attempts,
            now,
        );
        (
            TaskState::Cancelled,
            TransitionPatch::new(now).last_error(detail),
        )
    })
    .await?;
    if settled.is_some() {
        info!(task_id = %task.id, queue = %task.queue, attempt, "task cancelled");
    }
    Ok(settled)
}
