//! Dispatcher - キューごとの制御ループ
//!
//! 1 tick の流れ:
//! 1. 空きスロット = min(キューの同時実行上限 - 実行中, グローバル残り)
//! 2. `peek_batch` で batch_size 件まで候補を優先度順に取得
//! 3. 候補ごとに slot → `try_reserve` → `PENDING→ADMITTED→RUNNING` → 実行ユニット起動
//!    予約が拒否されたらその tick は打ち切る（後ろの候補で追い越さない）
//!
//! ループはキューごとに 1 本。supervisor が QueueRegistry の version を見て
//! ループの起動・停止を行うので、設定変更に再起動は要らない。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::Shared;
use super::execution::ExecutionUnit;
use crate::domain::{SchedulerError, Task, TaskId, TaskState, TransitionPatch};
use crate::ledger::Reservation;
use crate::ports::JobBody;
use crate::queue::QueueConfig;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Admitted and launched, in admission order.
    pub admitted: Vec<TaskId>,
    /// Candidate whose reservation was denied; the tick stopped there.
    pub blocked_on: Option<TaskId>,
    /// Candidates lost to a concurrent transition (e.g. cancelled meanwhile)
    /// or left pending because no body handles their kind.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Runs one scheduling tick for `queue`.
    pub async fn tick(&self, queue: &str) -> Result<TickReport, SchedulerError> {
        let shared = &self.shared;
        let config = shared
            .queues
            .get(queue)
            .ok_or_else(|| SchedulerError::UnknownQueue(queue.to_string()))?;

        let mut report = TickReport::default();
        if !config.is_active || !config.is_running {
            return Ok(report);
        }
        if shared.bodies.get(config.kind).is_none() {
            warn!(queue, kind = %config.kind, "no job body registered; skipping tick");
            return Ok(report);
        }

        let executing = shared.store.count_by_state(queue).await?.executing();
        let slots = config
            .max_concurrency
            .saturating_sub(executing)
            .min(shared.slots.available_permits());
        if slots == 0 {
            debug!(queue, executing, "no free execution slots");
            return Ok(report);
        }

        let now = shared.clock.now();
        let candidates = shared
            .store
            .peek_batch(queue, config.batch_size, now, config.admission_order())
            .await?;

        for candidate in candidates {
            if report.admitted.len() >= slots {
                break;
            }
            // tasks keep the kind they were enqueued with across a queue kind reload
            let Some(body) = shared.bodies.get(candidate.kind) else {
                warn!(
                    task_id = %candidate.id,
                    queue,
                    kind = %candidate.kind,
                    "no job body for the task's kind; left pending"
                );
                report.skipped += 1;
                continue;
            };
            let Ok(permit) = Arc::clone(&shared.slots).try_acquire_owned() else {
                debug!(queue, "global execution slots exhausted");
                break;
            };
            let reservation = match shared.ledger.try_reserve(candidate.id, candidate.resources) {
                Ok(reservation) => reservation,
                Err(denied) => {
                    info!(
                        task_id = %candidate.id,
                        queue,
                        priority = %candidate.priority,
                        error = %denied,
                        "admission blocked on resources; tick stopped"
                    );
                    report.blocked_on = Some(candidate.id);
                    break;
                }
            };
            match self.launch(&config, &body, candidate, reservation, permit).await? {
                Some(id) => report.admitted.push(id),
                None => report.skipped += 1,
            }
        }

        Ok(report)
    }

    /// `PENDING -> ADMITTED -> RUNNING`, then hands off to an execution unit.
    /// Returns `None` when the candidate changed state under us.
    async fn launch(
        &self,
        config: &QueueConfig,
        body: &Arc<dyn JobBody>,
        candidate: Task,
        reservation: Reservation,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<TaskId>, SchedulerError> {
        let shared = &self.shared;
        let id = candidate.id;
        let now = shared.clock.now();

        let admitted = match shared
            .store
            .transition(id, TaskState::Pending, TaskState::Admitted, TransitionPatch::new(now))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                reservation.release();
                return lost_race(id, e);
            }
        };

        let ticket = shared.running.register(id, admitted.attempts);
        let task = match shared
            .store
            .transition(id, TaskState::Admitted, TaskState::Running, TransitionPatch::new(now))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                reservation.release();
                shared.running.finish(ticket);
                return lost_race(id, e);
            }
        };

        info!(
            task_id = %id,
            queue = %task.queue,
            priority = %task.priority,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            "task admitted"
        );

        let unit = ExecutionUnit {
            task,
            body: Arc::clone(body),
            store: Arc::clone(&shared.store),
            clock: Arc::clone(&shared.clock),
            failures: Arc::clone(&shared.failures),
            running: Arc::clone(&shared.running),
            wakeups: Arc::clone(&shared.wakeups),
            reservation,
            permit,
            ticket,
            cancel_grace: shared.settings.cancel_grace,
            checkpointing: config.checkpoint_enabled && body.supports_checkpoint(),
        };
        shared.spawn_unit(unit.run());
        Ok(Some(id))
    }
}

fn lost_race(id: TaskId, e: SchedulerError) -> Result<Option<TaskId>, SchedulerError> {
    match e {
        SchedulerError::StaleState { .. } | SchedulerError::InvalidTransition { .. } => {
            debug!(task_id = %id, error = %e, "candidate changed state before launch");
            Ok(None)
        }
        other => Err(other),
    }
}

/// Keeps one loop per configured queue until shutdown.
pub(crate) async fn supervise(dispatcher: Dispatcher, mut shutdown_rx: watch::Receiver<bool>) {
    let mut versions = dispatcher.shared.queues.subscribe();
    let mut loops: HashMap<String, (watch::Sender<bool>, JoinHandle<()>)> = HashMap::new();

    loop {
        reconcile(&dispatcher, &mut loops);
        // config changes (resume, larger caps) take effect without waiting out the interval
        dispatcher.shared.wakeups.wake_all();

        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() {
                    break;
                }
            }
            res = versions.changed() => {
                if res.is_err() {
                    break;
                }
            }
        }
    }

    for (_, (stop, join)) in loops {
        let _ = stop.send(true);
        let _ = join.await;
    }
    info!("dispatcher supervisor stopped");
}

fn reconcile(
    dispatcher: &Dispatcher,
    loops: &mut HashMap<String, (watch::Sender<bool>, JoinHandle<()>)>,
) {
    let names = dispatcher.shared.queues.names();

    loops.retain(|name, (stop, join)| {
        let keep = names.contains(name) && !join.is_finished();
        if !keep {
            let _ = stop.send(true);
        }
        keep
    });

    for name in names {
        if loops.contains_key(&name) {
            continue;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(queue_loop(dispatcher.clone(), name.clone(), stop_rx));
        loops.insert(name, (stop_tx, join));
    }
}

async fn queue_loop(dispatcher: Dispatcher, queue: String, mut shutdown_rx: watch::Receiver<bool>) {
    info!(queue = %queue, "queue loop started");
    let wakeup = dispatcher.shared.wakeups.handle(&queue);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        // 設定は毎 tick 読み直す（hot reload）
        let Some(config) = dispatcher.shared.queues.get(&queue) else {
            break;
        };

        match dispatcher.tick(&queue).await {
            Ok(report) if !report.admitted.is_empty() => {
                debug!(queue = %queue, admitted = report.admitted.len(), "tick admitted tasks");
            }
            Ok(_) => {}
            Err(e) => warn!(queue = %queue, error = %e, "tick failed"),
        }

        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(config.processing_interval()) => {}
            _ = wakeup.notified() => {}
        }
    }
    info!(queue = %queue, "queue loop stopped");
}
