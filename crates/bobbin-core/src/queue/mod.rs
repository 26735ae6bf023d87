//! Queue module: admission ordering, queue configuration, retry policy and
//! the failure decider.

pub mod admission;
pub mod config;
pub mod decision;
pub mod retry;

pub use admission::{AdmissionOrder, PendingIndex};
pub use config::{QueueConfig, QueueRegistry};
pub use decision::{Decider, DecisionInput, DefaultDecider, RetryDecision};
pub use retry::{Backoff, RetryPolicy};
