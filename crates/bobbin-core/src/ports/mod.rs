//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。永続化・時刻・ID・イベント・実行本体を
//! trait の裏に隠し、app 層はこれらだけに依存する。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod job_body;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, FanoutSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_body::JobBody;
pub use self::task_store::TaskStore;
