//! Impls - ports の実装（開発用・テスト用）
//!
//! 本番用の永続化ストアは別クレートで TaskStore を実装する想定。

pub mod inmem_store;

pub use self::inmem_store::InMemoryTaskStore;
