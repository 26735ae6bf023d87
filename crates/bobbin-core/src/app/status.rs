//! Status - 外部 API 向けのステータスビュー
//!
//! キュー設定のフラグとメトリクスのカウンタを結合したもの。
//! 読み取り専用のスナップショットで、取得した瞬間以降は更新されない。

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::metrics::QueueCounters;
use crate::domain::{ResourceClass, StateCounts, TaskKind};
use crate::ledger::LedgerSnapshot;
use crate::queue::QueueConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub kind: TaskKind,
    pub description: Option<String>,
    pub is_active: bool,
    pub is_running: bool,
    pub priority_enabled: bool,
    pub max_queue_size: usize,
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub depth: usize,
    pub running: usize,
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub states: StateCounts,
}

impl QueueStatus {
    pub(crate) fn new(config: &QueueConfig, counters: QueueCounters) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            description: config.description.clone(),
            is_active: config.is_active,
            is_running: config.is_running,
            priority_enabled: config.priority_enabled,
            max_queue_size: config.max_queue_size,
            max_concurrency: config.max_concurrency,
            batch_size: config.batch_size,
            depth: counters.depth,
            running: counters.running,
            total_processed: counters.total_processed,
            success_count: counters.success_count,
            error_count: counters.error_count,
            last_processed_at: counters.last_processed_at,
            states: counters.states,
        }
    }

    /// Share of finished attempts that completed, in percent.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_processed > 0)
            .then(|| self.success_count as f64 * 100.0 / self.total_processed as f64)
    }
}

/// Utilization per resource class, in percent of the cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
}

impl From<&LedgerSnapshot> for Utilization {
    fn from(snapshot: &LedgerSnapshot) -> Self {
        Self {
            cpu: snapshot.utilization(ResourceClass::Cpu),
            memory: snapshot.utilization(ResourceClass::Memory),
            storage: snapshot.utilization(ResourceClass::Storage),
        }
    }
}

/// Global concurrency and resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub max_concurrent_executions: usize,
    pub running_executions: usize,
    pub available_slots: usize,
    pub resources: LedgerSnapshot,
    pub utilization: Utilization,
    pub queues: Vec<QueueStatus>,
}
