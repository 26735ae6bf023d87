use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::{info, warn};

use bobbin_core::domain::{
    BacktestPayload, ExecutionFailure, JobPayload, Priority, ResourceRequest, SignalPayload,
    SignalType, TaskKind,
};
use bobbin_core::observability::init_logging;
use bobbin_core::ports::JobBody;
use bobbin_core::{Engine, EngineBuilder, EngineConfig, EnqueueRequest, JobContext};

#[derive(Debug, Parser)]
#[command(name = "bobbin", version, about = "Backtest and signal-delivery scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validates a config file and prints the resolved queues.
    CheckConfig {
        #[arg(long, env = "BOBBIN_CONFIG")]
        config: PathBuf,
    },
    /// Runs the engine with demo job bodies and a seeded workload.
    Run {
        /// Built-in defaults when omitted.
        #[arg(long, env = "BOBBIN_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
        #[arg(long, default_value_t = 4)]
        backtests: usize,
        #[arg(long, default_value_t = 3)]
        signals: usize,
    },
}

/// デモ用 backtest：step ごとに進捗を報告し、3 step ごとに checkpoint を残す
struct DemoBacktest {
    step_delay: Duration,
}

#[async_trait]
impl JobBody for DemoBacktest {
    fn kind(&self) -> TaskKind {
        TaskKind::Backtest
    }

    fn supports_checkpoint(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecutionFailure> {
        let JobPayload::Backtest(payload) = ctx.payload() else {
            return Err(ExecutionFailure::permanent("expected a backtest payload"));
        };
        let steps = payload
            .execution_params
            .get("steps")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .max(1);
        let first = ctx
            .resume_from()
            .and_then(|state| state.get("step"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        for step in first..steps {
            if ctx.is_cancelled() {
                return Err(ExecutionFailure::transient(format!("stopped at step {step}")));
            }
            tokio::time::sleep(self.step_delay).await;

            let done = step + 1;
            let progress = (done * 100 / steps).min(99) as u8;
            let reported = if ctx.checkpointing_enabled() && done % 3 == 0 {
                ctx.checkpoint(progress, json!({ "step": done })).await
            } else {
                ctx.report_progress(progress).await
            };
            reported.map_err(|e| ExecutionFailure::transient(e.to_string()))?;
        }

        Ok(json!({
            "config_id": payload.config_id,
            "execution_name": payload.execution_name,
            "steps": steps,
            "resumed_at_step": first,
        }))
    }
}

/// デモ用 signal 配信：ログに出すだけ
struct DemoSignalDelivery;

#[async_trait]
impl JobBody for DemoSignalDelivery {
    fn kind(&self) -> TaskKind {
        TaskKind::SignalDelivery
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, ExecutionFailure> {
        let JobPayload::SignalDelivery(signal) = ctx.payload() else {
            return Err(ExecutionFailure::permanent("expected a signal payload"));
        };
        info!(
            task_id = %ctx.task_id(),
            symbol = %signal.symbol,
            timeframe = %signal.timeframe,
            signal_type = %signal.signal_type,
            "signal delivered"
        );
        Ok(json!({ "delivered_at": Utc::now() }))
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    println!(
        "ok: {} queue(s), max_concurrent_executions={}",
        config.queues.len(),
        config.max_concurrent_executions
    );
    for queue in &config.queues {
        println!(
            "  {:<16} kind={:<16} max_concurrency={} batch_size={} retry_attempts={} active={}",
            queue.name,
            queue.kind,
            queue.max_concurrency,
            queue.batch_size,
            queue.retry_attempts,
            queue.is_active
        );
    }
    Ok(())
}

/// キュー設定に合わせてデモ用タスクを投入する
async fn seed(engine: &Engine, backtests: usize, signals: usize) {
    let symbols = ["AAPL", "MSFT", "NVDA", "AMZN", "GOOG"];
    for config in engine.queues().all() {
        let requests: Vec<EnqueueRequest> = match config.kind {
            TaskKind::Backtest => (0..backtests)
                .map(|i| {
                    let payload = JobPayload::Backtest(BacktestPayload {
                        config_id: format!("demo-{}", i % 2),
                        execution_name: format!("demo run {i}"),
                        execution_params: json!({ "steps": 6 + i }),
                        started_by: Some("bobbin-cli".into()),
                    });
                    let priority = Priority::new((i % 10) as u8).unwrap_or_default();
                    EnqueueRequest::new(config.name.clone(), payload)
                        .priority(priority)
                        .resources(ResourceRequest::new(1, 512, 0))
                })
                .collect(),
            TaskKind::SignalDelivery => (0..signals)
                .map(|i| {
                    let payload = JobPayload::SignalDelivery(SignalPayload {
                        signal_id: None,
                        strategy_instance_id: Some("demo".into()),
                        symbol: symbols[i % symbols.len()].into(),
                        market: "NASDAQ".into(),
                        timeframe: "1h".into(),
                        signal_type: SignalType::Buy,
                        valid_from: Utc::now(),
                        signal_data: json!({ "source": "bobbin-cli" }),
                    });
                    EnqueueRequest::new(config.name.clone(), payload)
                })
                .collect(),
        };

        for req in requests {
            if let Err(e) = engine.enqueue(req).await {
                warn!(queue = %config.name, error = %e, "seed enqueue rejected");
            }
        }
    }
}

async fn run(
    path: Option<&Path>,
    duration: Duration,
    backtests: usize,
    signals: usize,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    init_logging(config.logging.format, &config.logging.level);

    let engine = EngineBuilder::new(config)
        .register(DemoBacktest {
            step_delay: Duration::from_millis(200),
        })?
        .register(DemoSignalDelivery)?
        .build()
        .context("building engine")?;

    let handle = engine.start();
    seed(&engine, backtests, signals).await;

    tokio::select! {
        _ = tokio::time::sleep(duration) => info!("run duration elapsed"),
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            info!("interrupted");
        }
    }

    handle.request_shutdown();
    let status = engine.engine_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    handle.shutdown_and_join().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config } => check_config(&config),
        Command::Run {
            config,
            duration_secs,
            backtests,
            signals,
        } => run(config.as_deref(), Duration::from_secs(duration_secs), backtests, signals).await,
    }
}
