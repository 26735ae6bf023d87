//! Per-queue configuration and the hot-reloadable registry that owns it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use super::admission::AdmissionOrder;
use super::retry::{Backoff, MAX_DURATION, RetryPolicy};
use crate::domain::{SchedulerError, TaskKind};

/// Configuration of one named queue. The backtest executor is a queue too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: TaskKind,
    #[serde(default)]
    pub description: Option<String>,

    /// Pending backlog limit.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_true")]
    pub priority_enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Executing tasks allowed at once for this queue.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_processing_interval_ms")]
    pub processing_interval_ms: u64,

    /// Retries after the first attempt, so `max_attempts = retry_attempts + 1`.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub duplicate_check: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub is_running: bool,

    /// Defaults to three processing intervals.
    #[serde(default)]
    pub heartbeat_timeout_ms: Option<u64>,
    #[serde(default = "default_max_pending_age_ms")]
    pub max_pending_age_ms: u64,
    #[serde(default)]
    pub max_runtime_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,
}

fn default_kind() -> TaskKind {
    TaskKind::SignalDelivery
}

fn default_true() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrency() -> usize {
    5
}

fn default_processing_interval_ms() -> u64 {
    60_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    30_000
}

fn default_backoff() -> Backoff {
    Backoff::Exponential
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    3_600_000
}

fn default_max_pending_age_ms() -> u64 {
    24 * 3_600_000
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            max_queue_size: default_max_queue_size(),
            priority_enabled: true,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            processing_interval_ms: default_processing_interval_ms(),
            retry_attempts: default_retry_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            backoff: default_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            duplicate_check: true,
            is_active: true,
            is_running: true,
            heartbeat_timeout_ms: None,
            max_pending_age_ms: default_max_pending_age_ms(),
            max_runtime_ms: None,
            checkpoint_enabled: true,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_timeout_ms
                .unwrap_or(self.processing_interval_ms.saturating_mul(3)),
        )
    }

    pub fn max_pending_age(&self) -> Duration {
        Duration::from_millis(self.max_pending_age_ms)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_ms.map(Duration::from_millis)
    }

    pub fn admission_order(&self) -> AdmissionOrder {
        if self.priority_enabled {
            AdmissionOrder::Priority
        } else {
            AdmissionOrder::Fifo
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_interval_ms),
            backoff: self.backoff,
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err("queue name must not be empty".into());
        }
        let positive = [
            ("max_queue_size", self.max_queue_size as u64),
            ("batch_size", self.batch_size as u64),
            ("max_concurrency", self.max_concurrency as u64),
            ("processing_interval_ms", self.processing_interval_ms),
            ("retry_interval_ms", self.retry_interval_ms),
            ("max_pending_age_ms", self.max_pending_age_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(format!("queue {name:?}: {field} must be positive"));
            }
        }
        let cap = MAX_DURATION.as_millis() as u64;
        let durations = [
            ("processing_interval_ms", Some(self.processing_interval_ms)),
            ("retry_interval_ms", Some(self.retry_interval_ms)),
            ("max_retry_delay_ms", Some(self.max_retry_delay_ms)),
            ("max_pending_age_ms", Some(self.max_pending_age_ms)),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("max_runtime_ms", self.max_runtime_ms),
        ];
        for (field, value) in durations {
            if value.is_some_and(|v| v > cap) {
                return Err(format!("queue {name:?}: {field} must be at most {cap}"));
            }
        }
        if self.heartbeat_timeout_ms == Some(0) {
            return Err(format!("queue {name:?}: heartbeat_timeout_ms must be positive"));
        }
        if self.max_runtime_ms == Some(0) {
            return Err(format!("queue {name:?}: max_runtime_ms must be positive"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!("queue {name:?}: backoff_multiplier must be >= 1.0"));
        }
        if self.max_retry_delay_ms < self.retry_interval_ms {
            return Err(format!(
                "queue {name:?}: max_retry_delay_ms must be >= retry_interval_ms"
            ));
        }
        Ok(())
    }
}

/// Owns every queue config. Mutations bump a version on a watch channel so the
/// dispatcher supervisor can start or stop queue loops without a restart.
/// Queue loops re-read their config on every tick.
pub struct QueueRegistry {
    queues: RwLock<BTreeMap<String, QueueConfig>>,
    version: watch::Sender<u64>,
}

impl QueueRegistry {
    pub fn new(configs: Vec<QueueConfig>) -> Result<Self, SchedulerError> {
        let queues = build_map(configs)?;
        let (version, _) = watch::channel(0);
        Ok(Self {
            queues: RwLock::new(queues),
            version,
        })
    }

    pub fn get(&self, name: &str) -> Option<QueueConfig> {
        self.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<QueueConfig> {
        self.read().values().cloned().collect()
    }

    pub fn upsert(&self, config: QueueConfig) -> Result<(), SchedulerError> {
        config.validate().map_err(SchedulerError::Validation)?;
        info!(queue = %config.name, kind = %config.kind, "queue config upserted");
        self.write().insert(config.name.clone(), config);
        self.bump();
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<QueueConfig> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            info!(queue = name, "queue config removed");
            self.bump();
        }
        removed
    }

    /// Pause or resume dispatching for a queue. Enqueue is unaffected.
    pub fn set_running(&self, name: &str, running: bool) -> Result<(), SchedulerError> {
        self.update(name, |c| c.is_running = running)
    }

    /// An inactive queue rejects enqueue and is not dispatched.
    pub fn set_active(&self, name: &str, active: bool) -> Result<(), SchedulerError> {
        self.update(name, |c| c.is_active = active)
    }

    /// Replaces the whole set atomically.
    pub fn reload(&self, configs: Vec<QueueConfig>) -> Result<(), SchedulerError> {
        let queues = build_map(configs)?;
        info!(queues = queues.len(), "queue configs reloaded");
        *self.write() = queues;
        self.bump();
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut QueueConfig)) -> Result<(), SchedulerError> {
        {
            let mut queues = self.write();
            let config = queues
                .get_mut(name)
                .ok_or_else(|| SchedulerError::UnknownQueue(name.to_string()))?;
            f(config);
        }
        self.bump();
        Ok(())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, QueueConfig>> {
        self.queues.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, QueueConfig>> {
        self.queues.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_map(configs: Vec<QueueConfig>) -> Result<BTreeMap<String, QueueConfig>, SchedulerError> {
    let mut map = BTreeMap::new();
    for config in configs {
        config.validate().map_err(SchedulerError::Validation)?;
        let name = config.name.clone();
        if map.insert(name.clone(), config).is_some() {
            return Err(SchedulerError::Validation(format!(
                "queue {name:?} is configured twice"
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_signal_queue_settings() {
        let cfg: QueueConfig = toml::from_str(r#"name = "signals""#).unwrap();
        assert_eq!(cfg.kind, TaskKind::SignalDelivery);
        assert_eq!(cfg.max_queue_size, 1000);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.max_attempts(), 4);
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(180));
        assert_eq!(cfg.admission_order(), AdmissionOrder::Priority);
        assert_eq!(cfg, QueueConfig::new("signals", TaskKind::SignalDelivery));
    }

    #[test]
    fn validate_rejects_zero_values() {
        let cfg = QueueConfig {
            batch_size: 0,
            ..QueueConfig::new("q", TaskKind::SignalDelivery)
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("batch_size must be positive"));
    }

    #[test]
    fn validate_rejects_durations_beyond_a_year() {
        let cfg = QueueConfig {
            max_pending_age_ms: 10_u64.pow(16),
            ..QueueConfig::new("q", TaskKind::Backtest)
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("max_pending_age_ms must be at most"));

        let cfg = QueueConfig {
            max_runtime_ms: Some(u64::MAX),
            ..QueueConfig::new("q", TaskKind::Backtest)
        };
        assert!(cfg.validate().is_err());

        let cfg = QueueConfig {
            max_pending_age_ms: MAX_DURATION.as_millis() as u64,
            max_retry_delay_ms: MAX_DURATION.as_millis() as u64,
            ..QueueConfig::new("q", TaskKind::Backtest)
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let a = QueueConfig::new("q", TaskKind::SignalDelivery);
        let result = QueueRegistry::new(vec![a.clone(), a]);
        assert!(matches!(result, Err(SchedulerError::Validation(_))));
    }

    #[test]
    fn mutations_bump_the_version() {
        let registry = QueueRegistry::new(vec![QueueConfig::new("q", TaskKind::Backtest)]).unwrap();
        let rx = registry.subscribe();
        assert_eq!(*rx.borrow(), 0);

        registry.set_running("q", false).unwrap();
        assert!(!registry.get("q").unwrap().is_running);
        assert_eq!(*rx.borrow(), 1);

        registry
            .upsert(QueueConfig::new("signals", TaskKind::SignalDelivery))
            .unwrap();
        assert_eq!(registry.names(), vec!["q".to_string(), "signals".to_string()]);

        registry.reload(vec![QueueConfig::new("only", TaskKind::Backtest)]).unwrap();
        assert_eq!(registry.names(), vec!["only".to_string()]);
        assert_eq!(*rx.borrow(), 3);
    }

    #[test]
    fn unknown_queue_is_reported() {
        let registry = QueueRegistry::new(vec![]).unwrap();
        assert!(matches!(
            registry.set_active("nope", false),
            Err(SchedulerError::UnknownQueue(_))
        ));
        assert!(registry.remove("nope").is_none());
    }
}
