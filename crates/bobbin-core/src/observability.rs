//! Logging initialisation and span helpers.

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::domain::{TaskId, TaskKind};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// JSON lines, for shipping to a collector.
    Json,
    #[default]
    Pretty,
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Only the first call has an effect.
pub fn init_logging(format: LogFormat, default_level: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Span wrapping one execution attempt of a job body.
#[must_use]
pub fn attempt_span(task_id: TaskId, queue: &str, kind: TaskKind, attempt: u32) -> Span {
    tracing::info_span!(
        "attempt",
        task_id = %task_id,
        queue = queue,
        kind = %kind,
        attempt = attempt,
    )
}
