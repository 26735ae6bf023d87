//! Engine - 外部管理層から見た表面
//!
//! enqueue / cancel / 状態取得 / purge を提供し、`start()` で
//! dispatcher supervisor と reaper loop を起動する。
//!
//! 共有状態（store, ledger, queue registry, running registry）は `Shared` に
//! まとめて Arc で配る。グローバルな singleton は持たない。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use super::dispatcher::{Dispatcher, supervise};
use super::metrics::MetricsAggregator;
use super::reaper_loop::{Reaper, reaper_loop};
use super::registry::JobBodyRegistry;
use super::running::{RunSignal, RunningRegistry};
use super::settle::FailureHandler;
use super::status::{EngineStatus, QueueStatus, Utilization};
use crate::domain::{
    DedupKey, ErrorDetail, ErrorKind, FailureCause, JobPayload, Priority, ResourceRequest,
    SchedulerError, Task, TaskFilter, TaskId, TaskState, TransitionPatch,
};
use crate::impls::InMemoryTaskStore;
use crate::ledger::{ResourceCaps, ResourceLedger};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::queue::QueueRegistry;

#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineSettings {
    pub max_concurrent_executions: usize,
    pub cancel_grace: Duration,
    pub reaper_interval: Duration,
}

/// Services shared by the dispatcher, execution units and the reaper.
pub(crate) struct Shared {
    pub store: Arc<dyn TaskStore>,
    pub ledger: Arc<ResourceLedger>,
    pub queues: Arc<QueueRegistry>,
    pub bodies: Arc<JobBodyRegistry>,
    pub running: Arc<RunningRegistry>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub failures: Arc<FailureHandler>,
    pub metrics: Arc<MetricsAggregator>,
    /// Global execution slots.
    pub slots: Arc<Semaphore>,
    /// Pokes queue loops out of their sleep (new work, freed capacity).
    pub wakeups: Arc<Wakeups>,
    pub units: Mutex<JoinSet<()>>,
    pub settings: EngineSettings,
}

/// One `Notify` per queue loop. `notify_one` keeps a permit when the loop is
/// mid-tick, so the next wait returns at once instead of sleeping it out.
#[derive(Default)]
pub(crate) struct Wakeups {
    queues: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Wakeups {
    pub(crate) fn handle(&self, queue: &str) -> Arc<Notify> {
        let mut queues = self.lock();
        match queues.get(queue) {
            Some(notify) => Arc::clone(notify),
            None => {
                let notify = Arc::new(Notify::new());
                queues.insert(queue.to_string(), Arc::clone(&notify));
                notify
            }
        }
    }

    pub(crate) fn wake(&self, queue: &str) {
        self.handle(queue).notify_one();
    }

    /// Freed slots or resources may unblock any queue.
    pub(crate) fn wake_all(&self) {
        for notify in self.lock().values() {
            notify.notify_one();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Shared {
    pub(crate) fn spawn_unit<F>(&self, unit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut units = self.lock_units();
        while let Some(joined) = units.try_join_next() {
            if let Err(e) = joined
                && e.is_panic()
            {
                warn!(error = %e, "execution unit panicked");
            }
        }
        units.spawn(unit);
    }

    fn lock_units(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parameters of one `enqueue` call.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub queue: String,
    pub priority: Priority,
    pub payload: JobPayload,
    /// Overrides the key derived from the payload.
    pub dedup_key: Option<DedupKey>,
    pub resources: ResourceRequest,
    /// Overrides the queue's `retry_attempts + 1`.
    pub max_attempts: Option<u32>,
    /// Not admitted before this time.
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            queue: queue.into(),
            priority: Priority::default(),
            payload,
            dedup_key: None,
            resources: ResourceRequest::default(),
            max_attempts: None,
            not_before: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn dedup_key(mut self, key: DedupKey) -> Self {
        self.dedup_key = Some(key);
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    store: Arc<InMemoryTaskStore>,
}

impl Engine {
    pub(crate) fn new(shared: Arc<Shared>, store: Arc<InMemoryTaskStore>) -> Self {
        Self { shared, store }
    }

    /// Validates and persists a new `PENDING` task.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<TaskId, SchedulerError> {
        let shared = &self.shared;
        let config = shared
            .queues
            .get(&req.queue)
            .ok_or_else(|| SchedulerError::UnknownQueue(req.queue.clone()))?;

        if !config.is_active {
            return Err(SchedulerError::validation(format!(
                "queue {:?} is not active",
                config.name
            )));
        }
        if req.payload.kind() != config.kind {
            return Err(SchedulerError::validation(format!(
                "queue {:?} accepts {} tasks, got {}",
                config.name,
                config.kind,
                req.payload.kind()
            )));
        }
        req.payload.validate().map_err(SchedulerError::Validation)?;
        let max_attempts = req.max_attempts.unwrap_or_else(|| config.max_attempts());
        if max_attempts == 0 {
            return Err(SchedulerError::validation("max_attempts must be positive"));
        }

        let dedup_key = if config.duplicate_check {
            req.dedup_key.or_else(|| req.payload.derived_dedup_key())
        } else {
            None
        };

        let now = shared.clock.now();
        let id = shared.ids.generate_task_id();
        let mut task = Task::new(
            id,
            req.queue,
            req.priority,
            req.payload,
            dedup_key,
            req.resources,
            max_attempts,
            now,
        );
        if let Some(at) = req.not_before
            && at > now
        {
            task.scheduled_at = at;
        }

        let id = shared.store.create(task, config.max_queue_size).await?;
        info!(
            task_id = %id,
            queue = %config.name,
            priority = %req.priority,
            max_attempts,
            "task enqueued"
        );
        shared.wakeups.wake(&config.name);
        Ok(id)
    }

    /// Cancels a task and returns its final record.
    ///
    /// Terminal tasks are returned unchanged. A running task is signalled and
    /// this call waits until its execution unit has finished.
    pub async fn cancel(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let shared = &self.shared;
        loop {
            let task = shared.store.get(id).await?;
            match task.state {
                state if state.is_terminal() => return Ok(task),
                TaskState::Running | TaskState::Checkpointed => {
                    if let Some(mut done) =
                        shared.running.signal(id, Some(task.attempts), RunSignal::Cancel)
                    {
                        let finished = done.wait_for(|finished| *finished).await.is_ok();
                        if finished {
                            // the unit has written its final state (or requeued)
                            continue;
                        }
                    }
                }
                _ => {}
            }

            // pending, admitted, or executing without a live unit
            let now = shared.clock.now();
            let detail = ErrorDetail::new(
                FailureCause::Cancelled,
                ErrorKind::Permanent,
                "cancelled by request",
                task.attempts,
                now,
            );
            match shared
                .store
                .transition(
                    id,
                    task.state,
                    TaskState::Cancelled,
                    TransitionPatch::new(now).last_error(detail),
                )
                .await
            {
                Ok(cancelled) => {
                    info!(task_id = %id, queue = %cancelled.queue, from = %task.state, "task cancelled");
                    return Ok(cancelled);
                }
                Err(e) if e.is_stale() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_status(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.shared.store.get(id).await
    }

    pub async fn list_queue(
        &self,
        queue: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, SchedulerError> {
        self.shared.store.list_by_queue(queue, filter).await
    }

    pub fn queue_status(&self, name: &str) -> Result<QueueStatus, SchedulerError> {
        let config = self
            .shared
            .queues
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownQueue(name.to_string()))?;
        Ok(QueueStatus::new(&config, self.shared.metrics.queue(name)))
    }

    pub fn engine_status(&self) -> EngineStatus {
        let shared = &self.shared;
        let max = shared.settings.max_concurrent_executions;
        let available = shared.slots.available_permits();
        let resources = shared.ledger.snapshot();
        let queues = shared
            .queues
            .all()
            .iter()
            .map(|config| QueueStatus::new(config, shared.metrics.queue(&config.name)))
            .collect();
        EngineStatus {
            max_concurrent_executions: max,
            running_executions: max.saturating_sub(available),
            available_slots: available,
            utilization: Utilization::from(&resources),
            resources,
            queues,
        }
    }

    /// Deletes terminal tasks in `states` that finished before `older_than`.
    pub async fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<usize, SchedulerError> {
        self.shared.store.purge_terminal(older_than, states).await
    }

    /// Changes resource caps and wakes the queue loops so raised caps are
    /// used right away.
    pub fn set_resource_caps(&self, caps: ResourceCaps) {
        self.shared.ledger.set_capacity(caps);
        self.shared.wakeups.wake_all();
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.shared.queues
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.shared.ledger
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.shared.metrics
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.shared))
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(Arc::clone(&self.shared))
    }

    /// Every task record, in enqueue order. Feed it to
    /// `EngineBuilder::restore` to rebuild an engine.
    pub async fn snapshot(&self) -> Vec<Task> {
        self.store.snapshot().await
    }

    /// Spawns the dispatcher supervisor and the reaper.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = self.shared.settings;
        let joins = vec![
            tokio::spawn(supervise(self.dispatcher(), shutdown_rx.clone())),
            tokio::spawn(reaper_loop(self.reaper(), settings.reaper_interval, shutdown_rx)),
        ];
        info!(
            max_concurrent_executions = settings.max_concurrent_executions,
            queues = self.shared.queues.names().len(),
            "engine started"
        );
        EngineHandle {
            shutdown_tx,
            joins,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Handle for the background loops.
/// - `request_shutdown()` stops admission; running attempts keep going
/// - `shutdown_and_join()` also waits for running attempts to finish
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }

        let mut units = std::mem::take(&mut *self.shared.lock_units());
        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                warn!(error = %e, "execution unit panicked");
            }
        }
        info!("engine stopped");
    }
}
