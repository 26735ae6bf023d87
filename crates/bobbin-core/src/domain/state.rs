//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task state.
///
/// Transitions:
/// - Pending -> Admitted -> Running -> Completed
/// - Running -> Checkpointed -> Running
/// - Admitted | Running | Checkpointed -> Pending (retry with backoff)
/// - Admitted | Running | Checkpointed -> Failed (attempts exhausted)
/// - Pending | Admitted | Running | Checkpointed -> Cancelled
/// - Pending | Admitted | Running | Checkpointed -> Expired
///
/// Completed, Failed, Expired and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Admitted,
    Running,
    Checkpointed,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Pending,
        TaskState::Admitted,
        TaskState::Running,
        TaskState::Checkpointed,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Expired,
        TaskState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Expired | TaskState::Cancelled
        )
    }

    /// States in which a task counts toward dedup uniqueness.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// States in which a task holds (or is about to hold) an execution slot.
    pub fn is_executing(self) -> bool {
        matches!(
            self,
            TaskState::Admitted | TaskState::Running | TaskState::Checkpointed
        )
    }

    /// Whether `self -> next` is a legal edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Admitted) => true,
            (Admitted, Running) => true,
            (Running, Completed) | (Checkpointed, Completed) => true,
            (Running, Checkpointed) | (Checkpointed, Running) => true,
            (Admitted | Running | Checkpointed, Pending) => true,
            (Admitted | Running | Checkpointed, Failed) => true,
            (Pending | Admitted | Running | Checkpointed, Cancelled) => true,
            (Pending | Admitted | Running | Checkpointed, Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Admitted => "ADMITTED",
            TaskState::Running => "RUNNING",
            TaskState::Checkpointed => "CHECKPOINTED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Expired => "EXPIRED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub admitted: usize,
    pub running: usize,
    pub checkpointed: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        *self.slot_mut(state) += n;
    }

    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Admitted => self.admitted,
            TaskState::Running => self.running,
            TaskState::Checkpointed => self.checkpointed,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::Expired => self.expired,
            TaskState::Cancelled => self.cancelled,
        }
    }

    /// Tasks holding an execution slot.
    pub fn executing(&self) -> usize {
        self.admitted + self.running + self.checkpointed
    }

    fn slot_mut(&mut self, state: TaskState) -> &mut usize {
        match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Admitted => &mut self.admitted,
            TaskState::Running => &mut self.running,
            TaskState::Checkpointed => &mut self.checkpointed,
            TaskState::Completed => &mut self.completed,
            TaskState::Failed => &mut self.failed,
            TaskState::Expired => &mut self.expired,
            TaskState::Cancelled => &mut self.cancelled,
        }
    }
}
