//! Per-queue counters projected from task events.
//!
//! The aggregator only reads events; it never touches the store. Events from
//! different callers may arrive slightly out of order, so live counts are
//! signed internally and clamped at zero when read.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{StateCounts, TaskEvent, TaskState};
use crate::ports::EventSink;

#[derive(Debug, Clone, Default)]
struct QueueTally {
    states: HashMap<TaskState, i64>,
    processed: u64,
    success: u64,
    error: u64,
    last_processed_at: Option<DateTime<Utc>>,
}

/// Read view of one queue's counters.
///
/// `states` holds the live count for non-terminal states and a cumulative
/// count (including purged tasks) for terminal ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueCounters {
    pub depth: usize,
    pub running: usize,
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub states: StateCounts,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    queues: RwLock<HashMap<String, QueueTally>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, name: &str) -> QueueCounters {
        self.read()
            .get(name)
            .map(QueueTally::counters)
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, QueueCounters> {
        self.read()
            .iter()
            .map(|(name, tally)| (name.clone(), tally.counters()))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, QueueTally>> {
        self.queues.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, QueueTally>> {
        self.queues.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl QueueTally {
    fn counters(&self) -> QueueCounters {
        let mut states = StateCounts::default();
        for (state, n) in &self.states {
            states.add(*state, (*n).max(0) as usize);
        }
        QueueCounters {
            depth: states.pending,
            running: states.executing(),
            total_processed: self.processed,
            success_count: self.success,
            error_count: self.error,
            last_processed_at: self.last_processed_at,
            states,
        }
    }
}

impl EventSink for MetricsAggregator {
    fn emit(&self, event: &TaskEvent) {
        let mut queues = self.write();
        let tally = queues.entry(event.queue.clone()).or_default();

        if let Some(from) = event.from {
            *tally.states.entry(from).or_default() -= 1;
        }
        *tally.states.entry(event.to).or_default() += 1;

        if event.finishes_attempt() {
            tally.processed += 1;
            if event.is_success() {
                tally.success += 1;
            } else {
                tally.error += 1;
            }
            tally.last_processed_at = Some(
                tally
                    .last_processed_at
                    .map_or(event.at, |prev| prev.max(event.at)),
            );
        }
    }
}
