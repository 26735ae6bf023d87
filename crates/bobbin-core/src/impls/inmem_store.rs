//! In-memory TaskStore.
//!
//! One tokio `Mutex` guards the records and every index derived from them
//! (pending view, per-queue membership, dedup keys), so a compare-and-set
//! transition updates all of them atomically. Events are emitted after the
//! lock is released.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{
    DedupKey, SchedulerError, StateCounts, Task, TaskEvent, TaskFilter, TaskId, TaskState,
    TransitionPatch,
};
use crate::ports::{EventSink, TaskStore};
use crate::queue::{AdmissionOrder, PendingIndex};

#[derive(Default)]
struct StoreState {
    /// All task records (single source of truth).
    tasks: HashMap<TaskId, Task>,

    /// queue -> seq -> id, for listing in enqueue order.
    by_queue: HashMap<String, BTreeMap<u64, TaskId>>,

    /// Ordered view of PENDING tasks.
    pending: PendingIndex,

    /// Active holders of a dedup key.
    dedup: HashMap<(String, DedupKey), TaskId>,

    next_seq: u64,
}

impl StoreState {
    fn index(&mut self, task: &Task) {
        self.by_queue
            .entry(task.queue.clone())
            .or_default()
            .insert(task.seq, task.id);
        if task.state == TaskState::Pending {
            self.pending.insert(task);
        }
        if task.state.is_active()
            && let Some(key) = &task.dedup_key
        {
            self.dedup.insert((task.queue.clone(), key.clone()), task.id);
        }
    }

    fn queue_tasks<'a>(&'a self, queue: &str) -> impl Iterator<Item = &'a Task> + use<'a> {
        self.by_queue
            .get(queue)
            .into_iter()
            .flat_map(|ids| ids.values())
            .filter_map(|id| self.tasks.get(id))
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    sink: Arc<dyn EventSink>,
}

impl InMemoryTaskStore {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            sink,
        }
    }

    /// Rebuilds a store from `snapshot` output.
    ///
    /// Live tasks keep their old heartbeat; the reaper recovers any that were
    /// executing through the usual heartbeat-timeout path. One creation event
    /// per task is emitted so projections can rebuild their counts.
    pub fn from_snapshot(tasks: Vec<Task>, sink: Arc<dyn EventSink>) -> Self {
        let mut state = StoreState::default();
        let mut events = Vec::with_capacity(tasks.len());
        for task in tasks {
            state.next_seq = state.next_seq.max(task.seq);
            state.index(&task);
            events.push(TaskEvent {
                task_id: task.id,
                queue: task.queue.clone(),
                kind: task.kind,
                from: None,
                to: task.state,
                attempts: task.attempts,
                cause: None,
                at: task.completed_at.unwrap_or(task.enqueued_at),
            });
            state.tasks.insert(task.id, task);
        }
        info!(tasks = events.len(), "task store restored from snapshot");
        for event in &events {
            sink.emit(event);
        }
        Self {
            state: Mutex::new(state),
            sink,
        }
    }

    /// Every record, in enqueue order.
    pub async fn snapshot(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, mut task: Task, backlog_limit: usize) -> Result<TaskId, SchedulerError> {
        if task.state != TaskState::Pending {
            return Err(SchedulerError::validation(format!(
                "new tasks must be PENDING, got {}",
                task.state
            )));
        }

        let event = {
            let mut state = self.state.lock().await;

            if state.tasks.contains_key(&task.id) {
                return Err(SchedulerError::validation(format!("task {} already exists", task.id)));
            }
            if state.pending.len(&task.queue) >= backlog_limit {
                return Err(SchedulerError::QueueFull {
                    queue: task.queue.clone(),
                    limit: backlog_limit,
                });
            }
            if let Some(key) = &task.dedup_key
                && let Some(existing) = state.dedup.get(&(task.queue.clone(), key.clone()))
            {
                return Err(SchedulerError::DuplicateKey {
                    queue: task.queue.clone(),
                    key: key.clone(),
                    existing: *existing,
                });
            }

            state.next_seq += 1;
            task.seq = state.next_seq;
            state.index(&task);

            let event = TaskEvent {
                task_id: task.id,
                queue: task.queue.clone(),
                kind: task.kind,
                from: None,
                to: TaskState::Pending,
                attempts: 0,
                cause: None,
                at: task.enqueued_at,
            };
            state.tasks.insert(task.id, task);
            event
        }; // Lock released here

        debug!(task_id = %event.task_id, queue = %event.queue, "task created");
        self.sink.emit(&event);
        Ok(event.task_id)
    }

    async fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let state = self.state.lock().await;
        state.tasks.get(&id).cloned().ok_or(SchedulerError::NotFound(id))
    }

    async fn list_by_queue(
        &self,
        queue: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, SchedulerError> {
        let state = self.state.lock().await;
        let matching = state
            .queue_tasks(queue)
            .filter(|t| filter.matches(t))
            .skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }

    async fn peek_batch(
        &self,
        queue: &str,
        n: usize,
        now: DateTime<Utc>,
        order: AdmissionOrder,
    ) -> Result<Vec<Task>, SchedulerError> {
        let state = self.state.lock().await;
        Ok(state
            .pending
            .peek(queue, n, now, order)
            .into_iter()
            .filter_map(|id| state.tasks.get(&id).cloned())
            .collect())
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskState,
        next: TaskState,
        patch: TransitionPatch,
    ) -> Result<Task, SchedulerError> {
        let (updated, event) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let task = state.tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
            if task.state != expected {
                return Err(SchedulerError::StaleState {
                    id,
                    expected,
                    actual: task.state,
                });
            }
            if let Some(attempt) = patch.attempt
                && task.attempts != attempt
            {
                return Err(SchedulerError::StaleAttempt {
                    id,
                    expected: attempt,
                    actual: task.attempts,
                });
            }
            let refuse_admission =
                next == TaskState::Admitted && task.attempts >= task.max_attempts;
            if !expected.can_transition_to(next) || refuse_admission {
                return Err(SchedulerError::InvalidTransition {
                    id,
                    from: expected,
                    to: next,
                });
            }

            // index key uses the old scheduled_at
            if expected == TaskState::Pending {
                state.pending.remove(task);
            }

            let at = patch.at;
            let cause = patch
                .error_detail
                .as_ref()
                .or(patch.last_error.as_ref())
                .map(|d| d.cause);

            match next {
                TaskState::Admitted => {
                    task.attempts += 1;
                    task.admitted_at.get_or_insert(at);
                    task.last_attempt_at = Some(at);
                    task.last_heartbeat_at = Some(at);
                }
                TaskState::Running => {
                    task.started_at.get_or_insert(at);
                    task.last_heartbeat_at = Some(at);
                }
                TaskState::Checkpointed => {
                    task.last_heartbeat_at = Some(at);
                }
                TaskState::Pending => {
                    task.scheduled_at = patch.scheduled_at.unwrap_or(at);
                    task.pending_since = at;
                    task.last_heartbeat_at = None;
                }
                TaskState::Completed
                | TaskState::Failed
                | TaskState::Expired
                | TaskState::Cancelled => {
                    task.completed_at = Some(at);
                }
            }

            if let Some(p) = patch.progress {
                task.progress = task.progress.max(p.min(100));
            }
            if let Some(blob) = patch.checkpoint {
                task.checkpoint = Some(blob);
            }
            if let Some(result) = patch.result {
                task.result = Some(result);
            }
            if let Some(err) = patch.last_error {
                task.last_error = Some(err);
            }
            if matches!(next, TaskState::Failed | TaskState::Expired) {
                task.error_detail = patch.error_detail;
            }

            task.state = next;

            if next == TaskState::Pending {
                state.pending.insert(task);
            }
            if next.is_terminal()
                && let Some(key) = &task.dedup_key
            {
                let slot = (task.queue.clone(), key.clone());
                if state.dedup.get(&slot) == Some(&id) {
                    state.dedup.remove(&slot);
                }
            }

            let event = TaskEvent {
                task_id: id,
                queue: task.queue.clone(),
                kind: task.kind,
                from: Some(expected),
                to: next,
                attempts: task.attempts,
                cause,
                at,
            };
            (task.clone(), event)
        }; // Lock released here

        debug!(task_id = %id, queue = %updated.queue, from = %expected, to = %next, attempts = updated.attempts, "task transitioned");
        self.sink.emit(&event);
        Ok(updated)
    }

    async fn mark_progress(
        &self,
        id: TaskId,
        attempt: u32,
        progress: u8,
        checkpoint: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<Task, SchedulerError> {
        if progress > 100 {
            return Err(SchedulerError::validation(format!(
                "progress {progress} is out of range 0..=100"
            )));
        }
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        if task.state != TaskState::Running {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: task.state,
                to: TaskState::Running,
            });
        }
        if task.attempts != attempt {
            return Err(SchedulerError::StaleAttempt {
                id,
                expected: attempt,
                actual: task.attempts,
            });
        }
        // lower values still count as a heartbeat
        task.progress = task.progress.max(progress);
        if let Some(blob) = checkpoint {
            task.checkpoint = Some(blob);
        }
        task.last_heartbeat_at = Some(at);
        Ok(task.clone())
    }

    async fn count_by_state(&self, queue: &str) -> Result<StateCounts, SchedulerError> {
        let state = self.state.lock().await;
        let mut counts = StateCounts::default();
        for task in state.queue_tasks(queue) {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn list_live(&self) -> Result<Vec<Task>, SchedulerError> {
        let state = self.state.lock().await;
        let mut live: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();
        live.sort_by_key(|t| t.seq);
        Ok(live)
    }

    async fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<usize, SchedulerError> {
        if let Some(live) = states.iter().find(|s| !s.is_terminal()) {
            return Err(SchedulerError::validation(format!(
                "purge only accepts terminal states, got {live}"
            )));
        }

        let mut state = self.state.lock().await;
        let doomed: Vec<(TaskId, String, u64)> = state
            .tasks
            .values()
            .filter(|t| states.contains(&t.state))
            .filter(|t| t.completed_at.is_some_and(|c| c < older_than))
            .map(|t| (t.id, t.queue.clone(), t.seq))
            .collect();

        for (id, queue, seq) in &doomed {
            state.tasks.remove(id);
            if let Some(members) = state.by_queue.get_mut(queue) {
                members.remove(seq);
            }
        }
        drop(state);

        info!(purged = doomed.len(), %older_than, "terminal tasks purged");
        Ok(doomed.len())
    }
}
