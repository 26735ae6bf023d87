//! Errors - エラー型と分類
//!
//! `SchedulerError` は外部 API に返る分類。`ErrorDetail` はタスクに保存される
//! 失敗原因（監査用）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskState;
use super::task::{DedupKey, ResourceClass};

/// Whether a failed attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 一時的なエラー（リトライ推奨）
    Transient,
    /// 恒久的なエラー（リトライ無意味）
    Permanent,
}

/// Error reported by a job body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// What ended an attempt (or the task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Execution,
    Panicked,
    HeartbeatTimeout,
    RuntimeExceeded,
    Expired,
    Cancelled,
}

/// Structured failure cause stored on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub cause: FailureCause,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl ErrorDetail {
    pub fn new(
        cause: FailureCause,
        kind: ErrorKind,
        message: impl Into<String>,
        attempt: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            cause,
            kind,
            message: message.into(),
            attempt,
            at,
        }
    }
}

/// Reservation refused: the first class that would exceed its cap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource denied: {class} requested {requested}, {available} available")]
pub struct ResourceDenied {
    pub class: ResourceClass,
    pub requested: u64,
    pub available: u64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown queue {0:?}")]
    UnknownQueue(String),

    #[error("duplicate key {key} in queue {queue:?} (active task {existing})")]
    DuplicateKey {
        queue: String,
        key: DedupKey,
        existing: TaskId,
    },

    #[error("queue {queue:?} is full ({limit} pending)")]
    QueueFull { queue: String, limit: usize },

    #[error("stale state for {id}: expected {expected}, found {actual}")]
    StaleState {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("stale attempt for {id}: expected attempt {expected}, task is on {actual}")]
    StaleAttempt { id: TaskId, expected: u32, actual: u32 },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    ResourceDenied(#[from] ResourceDenied),

    #[error("execution failure: {0}")]
    Execution(#[from] ExecutionFailure),

    #[error("heartbeat timeout for {id}: silent for {silent_ms} ms")]
    HeartbeatTimeout { id: TaskId, silent_ms: i64 },
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for races the caller should resolve by re-reading and retrying.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            SchedulerError::StaleState { .. } | SchedulerError::StaleAttempt { .. }
        )
    }
}
