//! Task record and the typed payloads it carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::ErrorDetail;
use super::ids::TaskId;
use super::state::TaskState;

/// Which execution family a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backtest,
    SignalDelivery,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Backtest => "backtest",
            TaskKind::SignalDelivery => "signal_delivery",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission priority in `0..=9`. Lower is more urgent; the default is 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("priority {0} is out of range 0..=9")]
pub struct InvalidPriority(pub u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(5);
    pub const LOWEST: Priority = Priority(9);

    pub fn new(value: u8) -> Result<Self, InvalidPriority> {
        if value > Self::LOWEST.0 {
            return Err(InvalidPriority(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Resource classes tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Cpu,
    Memory,
    Storage,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceClass::Cpu => "cpu",
            ResourceClass::Memory => "memory",
            ResourceClass::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Compute/memory/storage units a task needs while it runs.
///
/// Signal deliveries normally request nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub cpu: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
}

impl ResourceRequest {
    pub fn new(cpu: u64, memory_mb: u64, storage_mb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            storage_mb,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory_mb == 0 && self.storage_mb == 0
    }

    pub fn amount(&self, class: ResourceClass) -> u64 {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Memory => self.memory_mb,
            ResourceClass::Storage => self.storage_mb,
        }
    }
}

/// Business identity used to suppress duplicate active tasks in one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parameters of one backtest execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestPayload {
    pub config_id: String,
    pub execution_name: String,
    #[serde(default)]
    pub execution_params: serde_json::Value,
    #[serde(default)]
    pub started_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
    CloseLong,
    CloseShort,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalType::Buy => "BUY",
            SignalType::Sell => "SELL",
            SignalType::Hold => "HOLD",
            SignalType::CloseLong => "CLOSE_LONG",
            SignalType::CloseShort => "CLOSE_SHORT",
        };
        f.write_str(s)
    }
}

/// A trading signal to hand to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub strategy_instance_id: Option<String>,
    pub symbol: String,
    pub market: String,
    pub timeframe: String,
    pub signal_type: SignalType,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub signal_data: serde_json::Value,
}

impl SignalPayload {
    /// `symbol:timeframe:signal_type:window`, where the window is `valid_from`
    /// truncated to the minute.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey(format!(
            "{}:{}:{}:{}",
            self.symbol,
            self.timeframe,
            self.signal_type,
            self.valid_from.format("%Y-%m-%dT%H:%M")
        ))
    }
}

/// Opaque job body input. The scheduler only looks at it for validation and
/// dedup key derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Backtest(BacktestPayload),
    SignalDelivery(SignalPayload),
}

impl JobPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            JobPayload::Backtest(_) => TaskKind::Backtest,
            JobPayload::SignalDelivery(_) => TaskKind::SignalDelivery,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobPayload::Backtest(p) => {
                if p.config_id.trim().is_empty() {
                    return Err("config_id must not be empty".into());
                }
                if p.execution_name.trim().is_empty() {
                    return Err("execution_name must not be empty".into());
                }
            }
            JobPayload::SignalDelivery(p) => {
                if p.symbol.trim().is_empty() {
                    return Err("symbol must not be empty".into());
                }
                if p.market.trim().is_empty() {
                    return Err("market must not be empty".into());
                }
                if p.timeframe.trim().is_empty() {
                    return Err("timeframe must not be empty".into());
                }
            }
        }
        Ok(())
    }

    /// Key used when the enqueue request does not name one.
    pub fn derived_dedup_key(&self) -> Option<DedupKey> {
        match self {
            JobPayload::Backtest(_) => None,
            JobPayload::SignalDelivery(p) => Some(p.dedup_key()),
        }
    }
}

/// Durable record of one schedulable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    pub kind: TaskKind,
    pub priority: Priority,
    pub payload: JobPayload,
    pub dedup_key: Option<DedupKey>,
    pub resources: ResourceRequest,

    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,

    /// Enqueue order within the store. Breaks ties between equal timestamps.
    pub seq: u64,

    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may be admitted. Only a requeue rewrites it.
    pub scheduled_at: DateTime<Utc>,
    /// When the task last entered `PENDING` (enqueue or requeue). Pending-age
    /// expiry counts from here, so time spent executing is not counted.
    pub pending_since: DateTime<Utc>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub progress: u8,
    pub checkpoint: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,

    /// Cause of the most recent failed attempt, kept across requeues.
    pub last_error: Option<ErrorDetail>,
    /// Terminal failure cause. Only set in `FAILED` or `EXPIRED`.
    pub error_detail: Option<ErrorDetail>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        queue: impl Into<String>,
        priority: Priority,
        payload: JobPayload,
        dedup_key: Option<DedupKey>,
        resources: ResourceRequest,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            kind: payload.kind(),
            priority,
            payload,
            dedup_key,
            resources,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts,
            seq: 0,
            enqueued_at: now,
            scheduled_at: now,
            pending_since: now,
            admitted_at: None,
            started_at: None,
            last_attempt_at: None,
            last_heartbeat_at: None,
            completed_at: None,
            progress: 0,
            checkpoint: None,
            result: None,
            last_error: None,
            error_detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Fields written alongside a state transition.
///
/// Timestamps implied by the target state (`admitted_at`, `completed_at`, ...)
/// are stamped by the store from `at`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPatch {
    pub at: DateTime<Utc>,
    /// When set, the write only applies while `attempts` equals this value.
    pub attempt: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub progress: Option<u8>,
    pub checkpoint: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<ErrorDetail>,
    pub error_detail: Option<ErrorDetail>,
}

impl TransitionPatch {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            attempt: None,
            scheduled_at: None,
            progress: None,
            checkpoint: None,
            result: None,
            last_error: None,
            error_detail: None,
        }
    }

    /// Fences the write to one attempt; a newer attempt gets `StaleAttempt`.
    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn checkpoint(mut self, blob: serde_json::Value) -> Self {
        self.checkpoint = Some(blob);
        self
    }

    pub fn result(mut self, value: serde_json::Value) -> Self {
        self.result = Some(value);
        self
    }

    pub fn last_error(mut self, detail: ErrorDetail) -> Self {
        self.last_error = Some(detail);
        self
    }

    pub fn error_detail(mut self, detail: ErrorDetail) -> Self {
        self.error_detail = Some(detail);
        self
    }
}

/// Listing filter for `list_by_queue`. Results come back in enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFilter {
    pub states: Vec<TaskState>,
    pub kind: Option<TaskKind>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn states(states: &[TaskState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.states.is_empty() || self.states.contains(&task.state))
            && self.kind.is_none_or(|k| k == task.kind)
    }
}
