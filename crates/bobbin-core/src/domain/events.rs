//! Events - ドメインイベント
//!
//! TaskStore は成功した遷移ごとに `TaskEvent` を EventSink に送る。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::FailureCause;
use super::ids::TaskId;
use super::state::TaskState;
use super::task::TaskKind;

/// One committed state change. `from` is `None` when the task was created
/// (or restored from a snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub queue: String,
    pub kind: TaskKind,
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub attempts: u32,
    pub cause: Option<FailureCause>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// An execution attempt ended: success, retry, terminal failure or expiry
    /// straight from an executing state.
    pub fn finishes_attempt(&self) -> bool {
        self.from.is_some_and(TaskState::is_executing)
            && matches!(
                self.to,
                TaskState::Completed | TaskState::Pending | TaskState::Failed | TaskState::Expired
            )
    }

    pub fn is_success(&self) -> bool {
        self.to == TaskState::Completed
    }
}
