//! Pending view: per-queue ordered index of `PENDING` tasks.
//!
//! Two orderings are kept side by side so a queue can flip its
//! `priority_enabled` flag at runtime without a rebuild:
//! - priority: `(priority, scheduled_at, seq)`
//! - fifo: `(scheduled_at, seq)`
//!
//! `seq` is the store's enqueue counter, so equal timestamps stay FIFO.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::domain::{Task, TaskId};

/// Which key the dispatcher pulls candidates by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOrder {
    Priority,
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    priority: u8,
    scheduled_at: DateTime<Utc>,
    seq: u64,
    id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FifoKey {
    scheduled_at: DateTime<Utc>,
    seq: u64,
    id: TaskId,
}

#[derive(Debug, Default)]
struct QueueIndex {
    by_priority: BTreeSet<PriorityKey>,
    by_time: BTreeSet<FifoKey>,
}

#[derive(Debug, Default)]
pub struct PendingIndex {
    queues: HashMap<String, QueueIndex>,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: &Task) {
        let (p, f) = keys(task);
        let index = self.queues.entry(task.queue.clone()).or_default();
        index.by_priority.insert(p);
        index.by_time.insert(f);
    }

    /// Removes the entry for `task` as it was indexed. The caller passes the
    /// record before rewriting `scheduled_at`.
    pub fn remove(&mut self, task: &Task) {
        let (p, f) = keys(task);
        if let Some(index) = self.queues.get_mut(&task.queue) {
            index.by_priority.remove(&p);
            index.by_time.remove(&f);
        }
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |i| i.by_time.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Up to `n` ids eligible at `now`. Future-scheduled entries are skipped,
    /// not treated as a barrier.
    pub fn peek(&self, queue: &str, n: usize, now: DateTime<Utc>, order: AdmissionOrder) -> Vec<TaskId> {
        let Some(index) = self.queues.get(queue) else {
            return Vec::new();
        };
        match order {
            AdmissionOrder::Priority => index
                .by_priority
                .iter()
                .filter(|k| k.scheduled_at <= now)
                .take(n)
                .map(|k| k.id)
                .collect(),
            // sorted by time: everything after the first future entry is future too
            AdmissionOrder::Fifo => index
                .by_time
                .iter()
                .take_while(|k| k.scheduled_at <= now)
                .take(n)
                .map(|k| k.id)
                .collect(),
        }
    }
}

fn keys(task: &Task) -> (PriorityKey, FifoKey) {
    (
        PriorityKey {
            priority: task.priority.value(),
            scheduled_at: task.scheduled_at,
            seq: task.seq,
            id: task.id,
        },
        FifoKey {
            scheduled_at: task.scheduled_at,
            seq: task.seq,
            id: task.id,
        },
    )
}
