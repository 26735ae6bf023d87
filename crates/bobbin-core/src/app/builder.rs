//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 設定されたキューの kind と `expect_kinds()` の kind は全て job body が必要
//! - build() 時に「必要集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError::MissingJobBodies を返す

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::engine::{Engine, EngineSettings, Shared, Wakeups};
use super::metrics::MetricsAggregator;
use super::registry::{JobBodyRegistry, RegistryError};
use super::running::RunningRegistry;
use super::settle::FailureHandler;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{SchedulerError, Task, TaskKind};
use crate::impls::InMemoryTaskStore;
use crate::ledger::ResourceLedger;
use crate::ports::{Clock, EventSink, FanoutSink, IdGenerator, JobBody, SystemClock, TaskStore, UlidGenerator};
use crate::queue::{Decider, DefaultDecider, QueueRegistry};

/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .register(BacktestBody::default())?
///     .register(SignalBody::new(notifier))?
///     .expect_kinds(&[TaskKind::Backtest])
///     .build()?;
/// let handle = engine.start();
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    bodies: JobBodyRegistry,
    expected_kinds: Vec<TaskKind>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    sinks: Vec<Arc<dyn EventSink>>,
    restore: Option<Vec<Task>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing job bodies for kinds {0:?}; register one per configured queue kind")]
    MissingJobBodies(Vec<TaskKind>),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid queue configuration: {0}")]
    Queues(#[from] SchedulerError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            bodies: JobBodyRegistry::new(),
            expected_kinds: Vec::new(),
            clock: Arc::new(SystemClock),
            decider: Arc::new(DefaultDecider),
            sinks: Vec::new(),
            restore: None,
        }
    }

    pub fn register<B: JobBody + 'static>(mut self, body: B) -> Result<Self, RegistryError> {
        self.bodies.register(Arc::new(body))?;
        Ok(self)
    }

    /// Kinds that must have a body even if no queue is configured for them yet.
    pub fn expect_kinds(mut self, kinds: &[TaskKind]) -> Self {
        self.expected_kinds = kinds.to_vec();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    /// Extra event consumer, next to the built-in metrics.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Starts from a previous `Engine::snapshot()`.
    pub fn restore(mut self, tasks: Vec<Task>) -> Self {
        self.restore = Some(tasks);
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        let registered = self.bodies.registered_kinds();
        let mut missing: Vec<TaskKind> = self
            .config
            .queue_kinds()
            .into_iter()
            .chain(self.expected_kinds.iter().copied())
            .filter(|kind| !registered.contains(kind))
            .collect();
        missing.sort();
        missing.dedup();
        if !missing.is_empty() {
            return Err(BuildError::MissingJobBodies(missing));
        }

        let queues = Arc::new(QueueRegistry::new(self.config.queues.clone())?);

        let metrics = Arc::new(MetricsAggregator::new());
        let mut fanout = FanoutSink::new(vec![Arc::clone(&metrics) as Arc<dyn EventSink>]);
        for sink in self.sinks {
            fanout.push(sink);
        }
        let sink: Arc<dyn EventSink> = Arc::new(fanout);

        let inmem = Arc::new(match self.restore {
            Some(tasks) => InMemoryTaskStore::from_snapshot(tasks, sink),
            None => InMemoryTaskStore::new(sink),
        });
        let store: Arc<dyn TaskStore> = Arc::clone(&inmem) as Arc<dyn TaskStore>;

        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));
        let ledger = Arc::new(ResourceLedger::new(self.config.resources, Arc::clone(&ids)));
        let failures = Arc::new(FailureHandler {
            store: Arc::clone(&store),
            queues: Arc::clone(&queues),
            decider: self.decider,
            clock: Arc::clone(&self.clock),
        });

        let settings = EngineSettings {
            max_concurrent_executions: self.config.max_concurrent_executions,
            cancel_grace: self.config.cancel_grace(),
            reaper_interval: self.config.reaper_interval(),
        };
        let shared = Arc::new(Shared {
            store,
            ledger,
            queues,
            bodies: Arc::new(self.bodies),
            running: Arc::new(RunningRegistry::new()),
            clock: self.clock,
            ids,
            failures,
            metrics,
            slots: Arc::new(Semaphore::new(settings.max_concurrent_executions)),
            wakeups: Arc::new(Wakeups::default()),
            units: Mutex::new(JoinSet::new()),
            settings,
        });
        Ok(Engine::new(shared, inmem))
    }
}
