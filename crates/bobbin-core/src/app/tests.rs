//! End-to-end scheduling scenarios.
//!
//! Ticks and reaper sweeps are driven by hand against a `FixedClock`, so
//! admission order and retry timing are deterministic. Execution units still
//! run as real tokio tasks; `drain()` waits for them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rstest::rstest;
use serde_json::{Value, json};

use super::{Engine, EngineBuilder, EnqueueRequest, JobContext, TickReport};
use crate::config::EngineConfig;
use crate::domain::{
    BacktestPayload, ExecutionFailure, FailureCause, JobPayload, Priority, ResourceRequest,
    SchedulerError, SignalPayload, SignalType, Task, TaskFilter, TaskId, TaskKind, TaskState,
};
use crate::ledger::ResourceCaps;
use crate::ports::{FixedClock, JobBody};
use crate::queue::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Succeed,
    Fail,
    /// Ignores cancellation; only an abort stops it.
    Hang,
    /// Returns as soon as cancellation is requested.
    StopOnCancel,
    /// Checkpoints and fails on a fresh start, succeeds when resuming.
    CheckpointThenResume,
}

struct ScriptedBody {
    kind: TaskKind,
    script: Script,
}

impl ScriptedBody {
    fn new(kind: TaskKind, script: Script) -> Self {
        Self { kind, script }
    }
}

#[async_trait]
impl JobBody for ScriptedBody {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn supports_checkpoint(&self) -> bool {
        self.script == Script::CheckpointThenResume
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecutionFailure> {
        match self.script {
            Script::Succeed => Ok(json!({ "attempt": ctx.attempt() })),
            Script::Fail => Err(ExecutionFailure::transient("downstream unavailable")),
            Script::Hang => std::future::pending::<Result<Value, ExecutionFailure>>().await,
            Script::StopOnCancel => {
                ctx.cancelled().await;
                Err(ExecutionFailure::transient("stopped on request"))
            }
            Script::CheckpointThenResume => match ctx.resume_from() {
                Some(state) => Ok(json!({ "resumed_from": state.clone() })),
                None => {
                    ctx.checkpoint(40, json!({ "step": 4 }))
                        .await
                        .map_err(|e| ExecutionFailure::transient(e.to_string()))?;
                    Err(ExecutionFailure::transient("worker node lost"))
                }
            },
        }
    }
}

/// Keeps the context of every attempt. Fails the first attempt and hangs on
/// the ones after it.
#[derive(Default)]
struct StashingBody {
    contexts: Arc<Mutex<Vec<JobContext>>>,
}

#[async_trait]
impl JobBody for StashingBody {
    fn kind(&self) -> TaskKind {
        TaskKind::Backtest
    }

    fn supports_checkpoint(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecutionFailure> {
        let attempt = ctx.attempt();
        self.contexts.lock().unwrap().push(ctx);
        if attempt == 1 {
            return Err(ExecutionFailure::transient("worker restarted"));
        }
        std::future::pending::<Result<Value, ExecutionFailure>>().await
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

fn backtest_queue() -> QueueConfig {
    QueueConfig::new("backtest", TaskKind::Backtest)
}

fn signal_queue() -> QueueConfig {
    QueueConfig::new("signals", TaskKind::SignalDelivery)
}

fn backtest(name: &str) -> JobPayload {
    JobPayload::Backtest(BacktestPayload {
        config_id: "cfg-momentum".into(),
        execution_name: name.into(),
        execution_params: json!({ "start": "2023-01-01", "end": "2023-12-31" }),
        started_by: Some("tester".into()),
    })
}

fn signal(symbol: &str) -> JobPayload {
    JobPayload::SignalDelivery(SignalPayload {
        signal_id: None,
        strategy_instance_id: Some("inst-7".into()),
        symbol: symbol.into(),
        market: "NASDAQ".into(),
        timeframe: "1h".into(),
        signal_type: SignalType::Buy,
        valid_from: t0(),
        signal_data: json!({ "price": 187.2 }),
    })
}

fn bt(name: &str) -> EnqueueRequest {
    EnqueueRequest::new("backtest", backtest(name))
}

fn prio(p: u8) -> Priority {
    Priority::new(p).unwrap()
}

struct Harness {
    engine: Engine,
    clock: FixedClock,
}

fn config(max_concurrent: usize, queues: Vec<QueueConfig>) -> EngineConfig {
    EngineConfig {
        max_concurrent_executions: max_concurrent,
        cancel_grace_ms: 100,
        queues,
        ..EngineConfig::default()
    }
}

fn harness(max_concurrent: usize, queues: Vec<QueueConfig>, bodies: Vec<ScriptedBody>) -> Harness {
    let clock = FixedClock::new(t0());
    let mut builder = EngineBuilder::new(config(max_concurrent, queues)).clock(Arc::new(clock.clone()));
    for body in bodies {
        builder = builder.register(body).unwrap();
    }
    Harness {
        engine: builder.build().unwrap(),
        clock,
    }
}

fn backtests(max_concurrent: usize, queue: QueueConfig, script: Script) -> Harness {
    harness(max_concurrent, vec![queue], vec![ScriptedBody::new(TaskKind::Backtest, script)])
}

impl Harness {
    async fn enqueue(&self, req: EnqueueRequest) -> TaskId {
        self.engine.enqueue(req).await.unwrap()
    }

    async fn tick(&self, queue: &str) -> TickReport {
        self.engine.dispatcher().tick(queue).await.unwrap()
    }

    async fn task(&self, id: TaskId) -> Task {
        self.engine.get_status(id).await.unwrap()
    }

    /// Waits until no execution unit holds a global slot.
    async fn drain(&self) {
        drain(&self.engine).await;
    }

    fn assert_ledger_balanced(&self) {
        assert_ledger_balanced(&self.engine);
    }
}

async fn drain(engine: &Engine) {
    for _ in 0..400 {
        if engine.engine_status().running_executions == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution units did not finish");
}

async fn wait_for_state(engine: &Engine, id: TaskId, want: TaskState) {
    let mut state = TaskState::Pending;
    for _ in 0..400 {
        state = engine.get_status(id).await.unwrap().state;
        if state == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} stuck in {state:?}, expected {want:?}");
}

fn assert_ledger_balanced(engine: &Engine) {
    let snapshot = engine.ledger().snapshot();
    assert_eq!(snapshot.granted, snapshot.released);
    assert_eq!(snapshot.outstanding, 0);
    assert_eq!(snapshot.committed, ResourceRequest::default());
}

// ---- admission order ----

#[tokio::test]
async fn higher_priority_first_then_enqueue_order_under_global_cap_of_one() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let a = h.enqueue(bt("a").priority(prio(5))).await;
    let b = h.enqueue(bt("b").priority(prio(1))).await;
    let c = h.enqueue(bt("c").priority(prio(5))).await;

    let mut order = Vec::new();
    for _ in 0..3 {
        let report = h.tick("backtest").await;
        assert_eq!(report.admitted.len(), 1);
        order.extend(report.admitted);
        h.drain().await;
    }

    assert_eq!(order, vec![b, a, c]);
    for id in [a, b, c] {
        let task = h.task(id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result, Some(json!({ "attempt": 1 })));
    }
    assert!(h.tick("backtest").await.admitted.is_empty());
    h.assert_ledger_balanced();
}

#[rstest]
#[case::priority_enabled(true)]
#[case::priority_disabled(false)]
#[tokio::test]
async fn equal_priority_is_admitted_in_enqueue_order(#[case] priority_enabled: bool) {
    let queue = QueueConfig {
        priority_enabled,
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Succeed);
    let mut ids = Vec::new();
    for name in ["w", "x", "y", "z"] {
        ids.push(h.enqueue(bt(name)).await);
    }

    let mut order = Vec::new();
    for _ in 0..ids.len() {
        order.extend(h.tick("backtest").await.admitted);
        h.drain().await;
    }
    assert_eq!(order, ids);
}

#[tokio::test]
async fn disabled_priority_ignores_priority_values() {
    let queue = QueueConfig {
        priority_enabled: false,
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Succeed);
    let a = h.enqueue(bt("a").priority(prio(5))).await;
    let b = h.enqueue(bt("b").priority(prio(1))).await;

    assert_eq!(h.tick("backtest").await.admitted, vec![a]);
    h.drain().await;
    assert_eq!(h.tick("backtest").await.admitted, vec![b]);
}

#[tokio::test]
async fn per_queue_concurrency_caps_a_tick() {
    let queue = QueueConfig {
        max_concurrency: 2,
        ..backtest_queue()
    };
    let h = backtests(5, queue, Script::Hang);
    for name in ["a", "b", "c"] {
        h.enqueue(bt(name)).await;
    }

    assert_eq!(h.tick("backtest").await.admitted.len(), 2);
    // both slots of the queue are taken
    assert!(h.tick("backtest").await.admitted.is_empty());
    let status = h.engine.queue_status("backtest").unwrap();
    assert_eq!(status.running, 2);
    assert_eq!(status.depth, 1);
}

#[tokio::test]
async fn future_not_before_is_not_admitted_early() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let id = h.enqueue(bt("later").not_before(t0() + secs(60))).await;

    assert!(h.tick("backtest").await.admitted.is_empty());
    h.clock.advance(secs(60));
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
}

// ---- retry and expiry ----

#[tokio::test]
async fn two_failures_with_max_attempts_two_end_failed() {
    let h = backtests(1, backtest_queue(), Script::Fail);
    let id = h.enqueue(bt("flaky").max_attempts(2)).await;

    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
    h.drain().await;
    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.scheduled_at, t0() + secs(30));
    assert_eq!(task.last_error.as_ref().map(|e| e.cause), Some(FailureCause::Execution));
    assert!(task.error_detail.is_none());

    // backoff has not elapsed yet
    assert!(h.tick("backtest").await.admitted.is_empty());

    h.clock.advance(secs(30));
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
    h.drain().await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 2);
    let detail = task.error_detail.unwrap();
    assert_eq!(detail.cause, FailureCause::Execution);
    assert_eq!(detail.attempt, 2);
    assert!(h.tick("backtest").await.admitted.is_empty());

    let status = h.engine.queue_status("backtest").unwrap();
    assert_eq!(status.total_processed, 2);
    assert_eq!(status.error_count, 2);
    assert_eq!(status.success_count, 0);
    assert_eq!(status.states.failed, 1);
    h.assert_ledger_balanced();
}

#[tokio::test]
async fn backoff_grows_between_attempts() {
    let h = backtests(1, backtest_queue(), Script::Fail);
    let id = h.enqueue(bt("flaky").max_attempts(3)).await;

    h.tick("backtest").await;
    h.drain().await;
    assert_eq!(h.task(id).await.scheduled_at, t0() + secs(30));

    h.clock.advance(secs(30));
    h.tick("backtest").await;
    h.drain().await;
    // second retry waits 2 x 30 s after the second attempt
    assert_eq!(h.task(id).await.scheduled_at, t0() + secs(30 + 60));
}

#[tokio::test]
async fn retry_delay_beyond_the_pending_age_expires_instead() {
    let queue = QueueConfig {
        retry_interval_ms: 60_000,
        max_pending_age_ms: 40_000,
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Fail);
    let id = h.enqueue(bt("late")).await;

    h.clock.advance(secs(20));
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
    h.drain().await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Expired);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.error_detail.map(|e| e.cause), Some(FailureCause::Expired));
    assert_eq!(task.last_error.map(|e| e.cause), Some(FailureCause::Execution));
    h.assert_ledger_balanced();
}

#[tokio::test]
async fn long_running_attempt_is_retried_not_expired() {
    let queue = QueueConfig {
        heartbeat_timeout_ms: Some(10_000),
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Hang);
    let id = h.enqueue(bt("marathon")).await;
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);

    // well past the 24 h pending age, all of it spent running
    h.clock.advance(chrono::Duration::hours(25));
    let report = h.engine.reaper().sweep().await.unwrap();
    assert_eq!(report.heartbeat_timeouts, vec![id]);
    h.drain().await;

    let report = h.engine.reaper().sweep().await.unwrap();
    assert!(report.expired.is_empty());
    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.pending_since, t0() + chrono::Duration::hours(25));

    h.clock.advance(secs(30));
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
    assert_eq!(h.task(id).await.attempts, 2);
}

#[tokio::test]
async fn pending_tasks_expire_without_consuming_an_attempt() {
    let queue = QueueConfig {
        max_pending_age_ms: 60_000,
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Succeed);
    let id = h.enqueue(bt("stale")).await;

    h.clock.advance(secs(60));
    assert!(h.engine.reaper().sweep().await.unwrap().is_empty());

    h.clock.advance(secs(1));
    let report = h.engine.reaper().sweep().await.unwrap();
    assert_eq!(report.expired, vec![id]);

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Expired);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.error_detail.map(|e| e.cause), Some(FailureCause::Expired));
    assert!(h.tick("backtest").await.admitted.is_empty());
}

// ---- resources ----

#[tokio::test]
async fn oversized_request_waits_until_caps_are_raised() {
    let h = backtests(2, backtest_queue(), Script::Succeed);
    let big = h
        .enqueue(bt("big").priority(prio(1)).resources(ResourceRequest::new(16, 0, 0)))
        .await;
    let small = h
        .enqueue(bt("small").resources(ResourceRequest::new(1, 512, 0)))
        .await;

    for _ in 0..3 {
        let report = h.tick("backtest").await;
        assert!(report.admitted.is_empty());
        // the smaller task behind it is not allowed to jump ahead
        assert_eq!(report.blocked_on, Some(big));
    }
    for id in [big, small] {
        let task = h.task(id).await;
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
    }

    h.engine.set_resource_caps(ResourceCaps {
        cpu: 32,
        ..ResourceCaps::default()
    });
    assert_eq!(h.tick("backtest").await.admitted, vec![big, small]);
    h.drain().await;
    assert_eq!(h.task(big).await.state, TaskState::Completed);
    assert_eq!(h.task(small).await.state, TaskState::Completed);
    h.assert_ledger_balanced();
}

#[tokio::test]
async fn cancelling_a_starved_task_unblocks_the_queue() {
    let h = backtests(2, backtest_queue(), Script::Succeed);
    let big = h
        .enqueue(bt("big").priority(prio(1)).resources(ResourceRequest::new(0, 1 << 20, 0)))
        .await;
    let small = h.enqueue(bt("small")).await;

    assert_eq!(h.tick("backtest").await.blocked_on, Some(big));
    assert_eq!(h.engine.cancel(big).await.unwrap().state, TaskState::Cancelled);
    assert_eq!(h.tick("backtest").await.admitted, vec![small]);
}

#[tokio::test]
async fn engine_status_reports_slots_and_utilization() {
    let h = backtests(2, backtest_queue(), Script::Hang);
    let id = h
        .enqueue(bt("heavy").resources(ResourceRequest::new(4, 0, 0)))
        .await;
    h.tick("backtest").await;

    let status = h.engine.engine_status();
    assert_eq!(status.max_concurrent_executions, 2);
    assert_eq!(status.running_executions, 1);
    assert_eq!(status.available_slots, 1);
    assert_eq!(status.utilization.cpu, 50.0);
    assert_eq!(status.resources.outstanding, 1);
    assert_eq!(status.queues.len(), 1);

    // body ignores the cancel and is aborted after the grace period
    assert_eq!(h.engine.cancel(id).await.unwrap().state, TaskState::Cancelled);
    assert_eq!(h.engine.engine_status().available_slots, 2);
    h.assert_ledger_balanced();
}

// ---- heartbeat and runtime ----

#[tokio::test]
async fn stale_heartbeat_forces_a_retry() {
    let queue = QueueConfig {
        heartbeat_timeout_ms: Some(10_000),
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Hang);
    let id = h.enqueue(bt("stuck")).await;
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
    assert_eq!(h.task(id).await.state, TaskState::Running);

    h.clock.advance(secs(5));
    assert!(h.engine.reaper().sweep().await.unwrap().is_empty());

    h.clock.advance(secs(6));
    let report = h.engine.reaper().sweep().await.unwrap();
    assert_eq!(report.heartbeat_timeouts, vec![id]);

    // the hung unit is aborted and gives back its slot and reservation
    h.drain().await;
    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(
        task.last_error.map(|e| e.cause),
        Some(FailureCause::HeartbeatTimeout)
    );
    h.assert_ledger_balanced();
}

#[tokio::test]
async fn stale_heartbeat_on_last_attempt_fails_the_task() {
    let queue = QueueConfig {
        heartbeat_timeout_ms: Some(10_000),
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Hang);
    let id = h.enqueue(bt("stuck").max_attempts(1)).await;
    h.tick("backtest").await;

    h.clock.advance(secs(11));
    h.engine.reaper().sweep().await.unwrap();
    h.drain().await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 1);
    assert_eq!(
        task.error_detail.map(|e| e.cause),
        Some(FailureCause::HeartbeatTimeout)
    );
}

#[tokio::test]
async fn max_runtime_is_enforced_by_the_reaper() {
    let queue = QueueConfig {
        max_runtime_ms: Some(5_000),
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Hang);
    let id = h.enqueue(bt("slow")).await;
    h.tick("backtest").await;

    h.clock.advance(secs(6));
    let report = h.engine.reaper().sweep().await.unwrap();
    assert_eq!(report.runtime_exceeded, vec![id]);
    h.drain().await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(
        task.last_error.map(|e| e.cause),
        Some(FailureCause::RuntimeExceeded)
    );
}

#[tokio::test]
async fn context_of_a_previous_attempt_cannot_touch_the_current_one() {
    let queue = QueueConfig {
        heartbeat_timeout_ms: Some(10_000),
        ..backtest_queue()
    };
    let clock = FixedClock::new(t0());
    let body = StashingBody::default();
    let contexts = Arc::clone(&body.contexts);
    let engine = EngineBuilder::new(config(1, vec![queue]))
        .clock(Arc::new(clock.clone()))
        .register(body)
        .unwrap()
        .build()
        .unwrap();
    let id = engine.enqueue(bt("restarted")).await.unwrap();

    engine.dispatcher().tick("backtest").await.unwrap();
    drain(&engine).await;
    assert_eq!(engine.get_status(id).await.unwrap().state, TaskState::Pending);

    clock.advance(secs(30));
    assert_eq!(engine.dispatcher().tick("backtest").await.unwrap().admitted, vec![id]);
    for _ in 0..400 {
        if contexts.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stale = contexts.lock().unwrap()[0].clone();
    assert_eq!(stale.attempt(), 1);

    clock.advance(secs(9));
    let err = stale.report_progress(90).await.unwrap_err();
    assert!(matches!(err, SchedulerError::StaleAttempt { expected: 1, actual: 2, .. }));
    let err = stale
        .checkpoint(95, json!({ "from": "attempt 1" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StaleAttempt { expected: 1, actual: 2, .. }));

    // attempt 2 has been silent since it started, whatever attempt 1 wrote
    clock.advance(secs(2));
    let report = engine.reaper().sweep().await.unwrap();
    assert_eq!(report.heartbeat_timeouts, vec![id]);
    drain(&engine).await;

    let task = engine.get_status(id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.progress, 0);
    assert!(task.checkpoint.is_none());
    assert_ledger_balanced(&engine);
}

// ---- checkpoints ----

#[tokio::test]
async fn checkpoint_survives_requeue_and_resumes() {
    let h = backtests(1, backtest_queue(), Script::CheckpointThenResume);
    let id = h.enqueue(bt("long")).await;

    h.tick("backtest").await;
    h.drain().await;
    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.progress, 40);
    assert_eq!(task.checkpoint, Some(json!({ "step": 4 })));

    h.clock.advance(secs(30));
    h.tick("backtest").await;
    h.drain().await;
    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.progress, 100);
    assert_eq!(task.result, Some(json!({ "resumed_from": { "step": 4 } })));
}

#[tokio::test]
async fn checkpointing_disabled_by_queue_is_refused() {
    let queue = QueueConfig {
        checkpoint_enabled: false,
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::CheckpointThenResume);
    let id = h.enqueue(bt("long").max_attempts(1)).await;

    h.tick("backtest").await;
    h.drain().await;
    let task = h.task(id).await;
    // the body surfaced the refusal as its failure
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.checkpoint.is_none());
    assert!(task.error_detail.unwrap().message.contains("checkpointing is disabled"));
}

// ---- cancellation ----

#[tokio::test]
async fn cancelling_a_terminal_task_is_idempotent() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let id = h.enqueue(bt("x")).await;

    let first = h.engine.cancel(id).await.unwrap();
    assert_eq!(first.state, TaskState::Cancelled);
    assert_eq!(first.last_error.as_ref().map(|e| e.cause), Some(FailureCause::Cancelled));

    let second = h.engine.cancel(id).await.unwrap();
    let third = h.engine.cancel(id).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(third, first);
    assert!(h.tick("backtest").await.admitted.is_empty());
}

#[tokio::test]
async fn cancelling_a_completed_task_leaves_it_completed() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let id = h.enqueue(bt("done")).await;
    h.tick("backtest").await;
    h.drain().await;

    let task = h.engine.cancel(id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
}

#[rstest]
#[case::cooperative(Script::StopOnCancel)]
#[case::forced_after_grace(Script::Hang)]
#[tokio::test]
async fn cancelling_a_running_task_waits_for_its_unit(#[case] script: Script) {
    let h = backtests(1, backtest_queue(), script);
    let id = h.enqueue(bt("running")).await;
    h.tick("backtest").await;
    assert_eq!(h.task(id).await.state, TaskState::Running);

    let task = h.engine.cancel(id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert_eq!(task.last_error.map(|e| e.cause), Some(FailureCause::Cancelled));
    assert_eq!(h.engine.engine_status().running_executions, 0);
    h.assert_ledger_balanced();
}

// ---- dedup and enqueue validation ----

#[tokio::test]
async fn duplicate_signal_is_rejected_while_active() {
    let h = harness(
        1,
        vec![signal_queue()],
        vec![ScriptedBody::new(TaskKind::SignalDelivery, Script::Succeed)],
    );
    let first = h.enqueue(EnqueueRequest::new("signals", signal("AAPL"))).await;

    let err = h
        .engine
        .enqueue(EnqueueRequest::new("signals", signal("AAPL")))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateKey { existing, .. } if existing == first));

    h.tick("signals").await;
    h.drain().await;
    assert_eq!(h.task(first).await.state, TaskState::Completed);

    // terminal tasks free the key
    h.enqueue(EnqueueRequest::new("signals", signal("AAPL"))).await;
    h.enqueue(EnqueueRequest::new("signals", signal("MSFT"))).await;
}

#[tokio::test]
async fn duplicate_check_can_be_disabled_per_queue() {
    let queue = QueueConfig {
        duplicate_check: false,
        ..signal_queue()
    };
    let h = harness(
        1,
        vec![queue],
        vec![ScriptedBody::new(TaskKind::SignalDelivery, Script::Succeed)],
    );
    let a = h.enqueue(EnqueueRequest::new("signals", signal("AAPL"))).await;
    let b = h.enqueue(EnqueueRequest::new("signals", signal("AAPL"))).await;
    assert_ne!(a, b);
    assert!(h.task(a).await.dedup_key.is_none());
}

#[tokio::test]
async fn backlog_limit_rejects_with_queue_full() {
    let queue = QueueConfig {
        max_queue_size: 2,
        ..backtest_queue()
    };
    let h = backtests(1, queue, Script::Succeed);
    h.enqueue(bt("a")).await;
    h.enqueue(bt("b")).await;

    let err = h.engine.enqueue(bt("c")).await.unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull { limit: 2, .. }));
}

#[tokio::test]
async fn enqueue_validation_errors() {
    let h = harness(
        1,
        vec![backtest_queue(), signal_queue()],
        vec![
            ScriptedBody::new(TaskKind::Backtest, Script::Succeed),
            ScriptedBody::new(TaskKind::SignalDelivery, Script::Succeed),
        ],
    );

    let err = h.engine.enqueue(EnqueueRequest::new("nope", backtest("a"))).await.unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownQueue(q) if q == "nope"));

    let err = h.engine.enqueue(EnqueueRequest::new("signals", backtest("a"))).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let err = h.engine.enqueue(bt("  ")).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(msg) if msg.contains("execution_name")));

    let err = h.engine.enqueue(bt("a").max_attempts(0)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    h.engine.queues().set_active("backtest", false).unwrap();
    let err = h.engine.enqueue(bt("a")).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(msg) if msg.contains("not active")));
}

// ---- queue control, listing, purge ----

#[tokio::test]
async fn paused_queue_is_not_dispatched_until_resumed() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let id = h.enqueue(bt("a")).await;

    h.engine.queues().set_running("backtest", false).unwrap();
    assert!(h.tick("backtest").await.admitted.is_empty());

    h.engine.queues().set_running("backtest", true).unwrap();
    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
}

#[tokio::test]
async fn listing_filters_by_state_in_enqueue_order() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let a = h.enqueue(bt("a")).await;
    let b = h.enqueue(bt("b")).await;
    let c = h.enqueue(bt("c")).await;
    h.engine.cancel(b).await.unwrap();

    let pending = h
        .engine
        .list_queue("backtest", &TaskFilter::states(&[TaskState::Pending]))
        .await
        .unwrap();
    let ids: Vec<TaskId> = pending.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![a, c]);

    let all = h.engine.list_queue("backtest", &TaskFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn purge_removes_old_terminal_tasks_only() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let done = h.enqueue(bt("a")).await;
    let live = h.enqueue(bt("b")).await;
    h.engine.cancel(done).await.unwrap();

    h.clock.advance(secs(3600));
    let err = h
        .engine
        .purge_terminal(t0() + secs(1), &[TaskState::Pending])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let purged = h
        .engine
        .purge_terminal(t0() + secs(1), &[TaskState::Cancelled, TaskState::Completed])
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(matches!(
        h.engine.get_status(done).await,
        Err(SchedulerError::NotFound(id)) if id == done
    ));
    assert_eq!(h.task(live).await.state, TaskState::Pending);
}

#[tokio::test]
async fn queued_tasks_keep_their_kind_across_a_queue_kind_reload() {
    let h = harness(
        1,
        vec![backtest_queue()],
        vec![
            ScriptedBody::new(TaskKind::Backtest, Script::Succeed),
            ScriptedBody::new(TaskKind::SignalDelivery, Script::Fail),
        ],
    );
    let id = h.enqueue(bt("queued before reload")).await;
    h.engine
        .queues()
        .upsert(QueueConfig::new("backtest", TaskKind::SignalDelivery))
        .unwrap();

    assert_eq!(h.tick("backtest").await.admitted, vec![id]);
    h.drain().await;
    let task = h.task(id).await;
    assert_eq!(task.kind, TaskKind::Backtest);
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.result, Some(json!({ "attempt": 1 })));
}

// ---- snapshot / restore ----

#[tokio::test]
async fn restored_running_task_is_recovered_through_heartbeat_timeout() {
    let queue = QueueConfig {
        heartbeat_timeout_ms: Some(10_000),
        ..backtest_queue()
    };
    let h = backtests(1, queue.clone(), Script::Hang);
    let id = h.enqueue(bt("survivor")).await;
    h.tick("backtest").await;
    let snapshot = h.engine.snapshot().await;

    let clock = h.clock.clone();
    let restored = EngineBuilder::new(config(1, vec![queue]))
        .clock(Arc::new(clock.clone()))
        .register(ScriptedBody::new(TaskKind::Backtest, Script::Succeed))
        .unwrap()
        .restore(snapshot)
        .build()
        .unwrap();
    assert_eq!(restored.get_status(id).await.unwrap().state, TaskState::Running);
    assert_eq!(restored.queue_status("backtest").unwrap().running, 1);

    clock.advance(secs(11));
    let report = restored.reaper().sweep().await.unwrap();
    assert_eq!(report.heartbeat_timeouts, vec![id]);

    clock.advance(secs(30));
    assert_eq!(restored.dispatcher().tick("backtest").await.unwrap().admitted, vec![id]);
    drain(&restored).await;

    let task = restored.get_status(id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 2);
    assert_ledger_balanced(&restored);
}

#[tokio::test]
async fn restored_running_task_can_be_cancelled_without_a_unit() {
    let h = backtests(1, backtest_queue(), Script::Hang);
    let id = h.enqueue(bt("orphan")).await;
    h.tick("backtest").await;

    let restored = EngineBuilder::new(config(1, vec![backtest_queue()]))
        .clock(Arc::new(h.clock.clone()))
        .register(ScriptedBody::new(TaskKind::Backtest, Script::Succeed))
        .unwrap()
        .restore(h.engine.snapshot().await)
        .build()
        .unwrap();

    let task = restored.cancel(id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
}

// ---- background loops ----

#[tokio::test]
async fn started_engine_dispatches_on_its_own_and_shuts_down() {
    let h = backtests(2, backtest_queue(), Script::Succeed);
    let handle = h.engine.start();
    let id = h.enqueue(bt("auto")).await;
    wait_for_state(&h.engine, id, TaskState::Completed).await;

    handle.shutdown_and_join().await;
    h.assert_ledger_balanced();
}

#[tokio::test]
async fn enqueue_before_the_loop_parks_is_not_lost() {
    let h = backtests(1, backtest_queue(), Script::Succeed);
    let handle = h.engine.start();
    // several pokes land while the loop is still starting or mid-tick;
    // the 60 s processing interval must not be what picks them up
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(h.enqueue(bt(&format!("burst {i}"))).await);
        tokio::task::yield_now().await;
    }
    for id in ids {
        wait_for_state(&h.engine, id, TaskState::Completed).await;
    }

    handle.shutdown_and_join().await;
    h.assert_ledger_balanced();
}

#[tokio::test]
async fn finished_unit_wakes_a_queue_waiting_on_its_slot() {
    let h = harness(
        1,
        vec![backtest_queue(), signal_queue()],
        vec![
            ScriptedBody::new(TaskKind::Backtest, Script::StopOnCancel),
            ScriptedBody::new(TaskKind::SignalDelivery, Script::Succeed),
        ],
    );
    let handle = h.engine.start();
    let slow = h.enqueue(bt("holds the only slot")).await;
    wait_for_state(&h.engine, slow, TaskState::Running).await;

    let sig = h.enqueue(EnqueueRequest::new("signals", signal("AAPL"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.task(sig).await.state, TaskState::Pending);

    // the backtest unit gives the slot back; the signal loop hears about it
    assert_eq!(h.engine.cancel(slow).await.unwrap().state, TaskState::Cancelled);
    wait_for_state(&h.engine, sig, TaskState::Completed).await;

    handle.shutdown_and_join().await;
    h.assert_ledger_balanced();
}
