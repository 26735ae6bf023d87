//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! max_concurrent_executions = 5
//!
//! [resources]
//! cpu = 8
//! memory_mb = 16384
//!
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [[queues]]
//! name = "backtest"
//! kind = "backtest"
//! max_concurrency = 2
//!
//! [[queues]]
//! name = "signals"
//! kind = "signal_delivery"
//! processing_interval_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::TaskKind;
use crate::ledger::ResourceCaps;
use crate::observability::LogFormat;
use crate::queue::QueueConfig;
use crate::queue::retry::MAX_DURATION;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global cap on executing tasks across all queues.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// How long a cancelled body may keep running before it is aborted.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default)]
    pub resources: ResourceCaps,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,
}

fn default_max_concurrent_executions() -> usize {
    5
}

fn default_reaper_interval_ms() -> u64 {
    1_000
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queues() -> Vec<QueueConfig> {
    vec![QueueConfig::new("backtest", TaskKind::Backtest)]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            reaper_interval_ms: default_reaper_interval_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            resources: ResourceCaps::default(),
            logging: LoggingConfig::default(),
            queues: default_queues(),
        }
    }
}

impl EngineConfig {
    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::ParseFile {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_executions must be positive".to_string(),
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "reaper_interval_ms must be positive".to_string(),
            ));
        }
        let cap = MAX_DURATION.as_millis() as u64;
        for (field, value) in [
            ("reaper_interval_ms", self.reaper_interval_ms),
            ("cancel_grace_ms", self.cancel_grace_ms),
        ] {
            if value > cap {
                return Err(ConfigError::Validation(format!(
                    "{field} must be at most {cap}"
                )));
            }
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate().map_err(ConfigError::Validation)?;
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "queue `{}` is defined more than once",
                    queue.name
                )));
            }
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Kinds some configured queue needs a job body for.
    pub fn queue_kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.queues.iter().map(|q| q.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}
