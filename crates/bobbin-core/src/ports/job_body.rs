//! JobBody port - 実行本体（バックテスト計算、シグナル配送）
//!
//! スケジューラは本体の中身を知らない。`execute` に JobContext を渡し、
//! 進捗・チェックポイント・キャンセルはコンテキスト経由でやり取りする。

use async_trait::async_trait;

use crate::app::context::JobContext;
use crate::domain::{ExecutionFailure, Task, TaskKind};

#[async_trait]
pub trait JobBody: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Whether `JobContext::checkpoint` is meaningful for this body.
    fn supports_checkpoint(&self) -> bool {
        false
    }

    /// Runs one attempt. The returned value is stored as the task result.
    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, ExecutionFailure>;

    /// Called once when a running attempt is asked to cancel, before the grace
    /// period starts.
    async fn on_cancel(&self, _task: &Task) {}
}
