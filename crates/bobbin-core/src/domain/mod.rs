//! Domain model (ids, task record, lifecycle, errors, events).

pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use self::errors::{
    ErrorDetail, ErrorKind, ExecutionFailure, FailureCause, ResourceDenied, SchedulerError,
};
pub use self::events::TaskEvent;
pub use self::ids::{ReservationId, TaskId};
pub use self::state::{StateCounts, TaskState};
pub use self::task::{
    BacktestPayload, DedupKey, InvalidPriority, JobPayload, Priority, ResourceClass,
    ResourceRequest, SignalPayload, SignalType, Task, TaskFilter, TaskKind, TransitionPatch,
};
