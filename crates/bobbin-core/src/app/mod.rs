//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューラを実装する。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 構築とワイヤリング（起動時検証）
//! - **Engine**: 外部管理層向けの表面（enqueue, cancel, status, purge）
//! - **Dispatcher**: キューごとの制御ループ（peek→reserve→admit→launch）
//! - **ExecutionUnit**: 1 attempt の実行（進捗・キャンセル・結果の反映）
//! - **Reaper**: ハートビート途絶・実行時間超過・期限切れの回収
//! - **MetricsAggregator**: イベントからのカウンタ集計

pub mod builder;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub(crate) mod execution;
pub mod metrics;
pub mod reaper_loop;
pub mod registry;
pub mod running;
pub(crate) mod settle;
pub mod status;

#[cfg(test)]
mod tests;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::context::JobContext;
pub use self::dispatcher::{Dispatcher, TickReport};
pub use self::engine::{Engine, EngineHandle, EnqueueRequest};
pub use self::metrics::{MetricsAggregator, QueueCounters};
pub use self::reaper_loop::{Reaper, SweepReport};
pub use self::registry::{JobBodyRegistry, RegistryError};
pub use self::status::{EngineStatus, QueueStatus, Utilization};
