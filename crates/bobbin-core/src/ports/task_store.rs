//! TaskStore port - タスクの正本（source of truth）
//!
//! # 設計原則
//! - `transition` (compare-and-set) が唯一の状態変更プリミティブ
//! - dedup と backlog 上限は `create` の中で原子的に判定する
//! - 成功した遷移ごとに EventSink へイベントを送る（ロック外で）
//! - pending ビュー（優先度順インデックス）は遷移に合わせて自動で出入りする

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    SchedulerError, StateCounts, Task, TaskFilter, TaskId, TaskState, TransitionPatch,
};
use crate::queue::AdmissionOrder;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new `PENDING` task and assigns its enqueue sequence.
    ///
    /// Fails with `QueueFull` when the queue already holds `backlog_limit`
    /// pending tasks, and with `DuplicateKey` when `task.dedup_key` is held by
    /// an active task of the same queue.
    async fn create(&self, task: Task, backlog_limit: usize) -> Result<TaskId, SchedulerError>;

    async fn get(&self, id: TaskId) -> Result<Task, SchedulerError>;

    async fn list_by_queue(
        &self,
        queue: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, SchedulerError>;

    /// Up to `n` pending tasks eligible at `now`, in admission order.
    /// Nothing is removed; admission happens through `transition`.
    async fn peek_batch(
        &self,
        queue: &str,
        n: usize,
        now: DateTime<Utc>,
        order: AdmissionOrder,
    ) -> Result<Vec<Task>, SchedulerError>;

    /// Atomic compare-and-set on the task state.
    ///
    /// `StaleState` when the current state is not `expected`;
    /// `InvalidTransition` when `expected -> next` is not a lifecycle edge or
    /// admission would exceed `max_attempts`.
    async fn transition(
        &self,
        id: TaskId,
        expected: TaskState,
        next: TaskState,
        patch: TransitionPatch,
    ) -> Result<Task, SchedulerError>;

    /// Heartbeat with progress (and optionally a checkpoint blob).
    /// Only valid while `RUNNING` on `attempt`; an older attempt gets
    /// `StaleAttempt`.
    async fn mark_progress(
        &self,
        id: TaskId,
        attempt: u32,
        progress: u8,
        checkpoint: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<Task, SchedulerError>;

    async fn count_by_state(&self, queue: &str) -> Result<StateCounts, SchedulerError>;

    /// Every non-terminal task, for the reaper.
    async fn list_live(&self) -> Result<Vec<Task>, SchedulerError>;

    /// Deletes terminal tasks in `states` completed before `older_than`.
    async fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<usize, SchedulerError>;
}
