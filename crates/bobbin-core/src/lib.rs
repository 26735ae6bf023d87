//! bobbin-core
//!
//! Execution and distribution scheduler for backtest runs and trading-signal
//! delivery queues.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, JobBody, EventSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore）
//! - **queue**: 優先度付き admission、キュー設定、リトライポリシー
//! - **ledger**: リソース予約（cpu / memory / storage）
//! - **app**: アプリケーションロジック（builder, engine, dispatcher, reaper, metrics）
//! - **config**, **observability**: 設定の読み込みとログ初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ledger;
pub mod observability;
pub mod ports;
pub mod queue;

pub use app::{Engine, EngineBuilder, EngineHandle, EnqueueRequest, JobContext};
pub use config::EngineConfig;
