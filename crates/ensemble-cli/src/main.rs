//! `ensemble` binary: demo pipeline and message-dump validation.

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ensemble_bus::{BusConfig, MessageBus};
use ensemble_core::{validate, EnsembleResult, Message, Priority};
use ensemble_role::{Role, RoleAgent, SchedulerConfig, Task, TaskContext};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ensemble", about = "Ensemble — a role-based agent team simulator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ensemble.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wire a small team to the bus, pump messages through, print stats
    Demo {
        /// Number of ping requests to send
        #[arg(short, long, default_value_t = 5)]
        messages: u32,
    },
    /// Round-trip a structural message dump and report validation errors
    Validate {
        /// Path to a JSON message file
        file: PathBuf,
    },
}

#[derive(Deserialize, Default)]
struct EnsembleConfig {
    #[serde(default)]
    bus: BusSection,
    #[serde(default)]
    scheduler: SchedulerSection,
}

#[derive(Deserialize)]
struct BusSection {
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
    #[serde(default = "default_bus_workers")]
    workers: usize,
    #[serde(default = "default_retention_hours")]
    retention_hours: i64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_bus_workers(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Deserialize)]
struct SchedulerSection {
    #[serde(default = "default_task_workers")]
    workers: usize,
    #[serde(default = "default_max_concurrent_tasks")]
    max_concurrent_tasks: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: default_task_workers(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_bus_workers() -> usize {
    3
}

fn default_retention_hours() -> i64 {
    24
}

fn default_task_workers() -> usize {
    3
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn load_config(path: &Path) -> anyhow::Result<EnsembleConfig> {
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return Ok(EnsembleConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

/// Answers pings and mirrors each one into a scheduled task.
struct WorkerRole;

#[async_trait]
impl Role for WorkerRole {
    fn role_id(&self) -> &str {
        "worker"
    }

    fn role_name(&self) -> &str {
        "Demo Worker"
    }

    async fn on_message(&self, agent: &RoleAgent, message: Message) -> EnsembleResult<()> {
        if message.body.action == "ping" {
            agent
                .submit_task("record_ping", message.body.data.clone(), Priority::Normal)
                .await?;
            agent
                .respond(
                    &message,
                    HashMap::from([("pong".to_string(), serde_json::json!(true))]),
                )
                .await?;
        }
        Ok(())
    }

    async fn run_task(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> EnsembleResult<serde_json::Value> {
        ctx.set_progress(0.5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(serde_json::json!({"recorded": task.payload}))
    }
}

/// Sends the pings and counts the correlated responses.
struct CoordinatorRole {
    responses: Arc<AtomicU32>,
}

#[async_trait]
impl Role for CoordinatorRole {
    fn role_id(&self) -> &str {
        "coordinator"
    }

    fn role_name(&self) -> &str {
        "Demo Coordinator"
    }

    async fn on_message(&self, _agent: &RoleAgent, message: Message) -> EnsembleResult<()> {
        if message.body.action == "ping_response" {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn run_task(
        &self,
        _task: &Task,
        _ctx: &TaskContext,
    ) -> EnsembleResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

/// Observes everything the worker sends, plus task updates.
struct AuditorRole;

#[async_trait]
impl Role for AuditorRole {
    fn role_id(&self) -> &str {
        "status_monitor"
    }

    fn role_name(&self) -> &str {
        "Demo Auditor"
    }

    async fn on_message(&self, _agent: &RoleAgent, message: Message) -> EnsembleResult<()> {
        info!(
            kind = %message.header.kind,
            from = %message.header.from_role,
            action = %message.body.action,
            "audited message"
        );
        Ok(())
    }

    async fn run_task(
        &self,
        _task: &Task,
        _ctx: &TaskContext,
    ) -> EnsembleResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

async fn run_demo(config: EnsembleConfig, messages: u32) -> anyhow::Result<()> {
    let bus = Arc::new(MessageBus::new(BusConfig {
        queue_capacity: config.bus.queue_capacity,
        workers: config.bus.workers,
        retention_hours: config.bus.retention_hours,
        poll_timeout: Duration::from_millis(50),
        ..BusConfig::default()
    }));
    bus.start();

    let scheduler_config = SchedulerConfig {
        workers: config.scheduler.workers,
        max_concurrent_tasks: config.scheduler.max_concurrent_tasks,
        poll_timeout: Duration::from_millis(50),
        ..SchedulerConfig::default()
    };

    let responses = Arc::new(AtomicU32::new(0));
    let worker = RoleAgent::new(Arc::new(WorkerRole), bus.clone(), scheduler_config.clone());
    let coordinator = RoleAgent::new(
        Arc::new(CoordinatorRole {
            responses: responses.clone(),
        }),
        bus.clone(),
        scheduler_config.clone(),
    );
    let auditor = RoleAgent::new(Arc::new(AuditorRole), bus.clone(), scheduler_config);

    auditor.start().await?;
    worker.start().await?;
    coordinator.start().await?;
    bus.subscribe("status_monitor", "worker");

    for i in 0..messages {
        coordinator
            .send(
                Message::request("coordinator", "worker", "ping")
                    .with_data("sequence", serde_json::json!(i)),
            )
            .await?;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while responses.load(Ordering::SeqCst) < messages && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let answered = responses.load(Ordering::SeqCst);
    if answered < messages {
        warn!(answered, expected = messages, "demo finished with missing responses");
    }

    // Let the task updates drain before reporting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = serde_json::json!({
        "bus": bus.stats(),
        "queue": bus.queue_status(),
        "worker": worker.status(),
        "coordinator": coordinator.status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    coordinator.shutdown().await;
    worker.shutdown().await;
    auditor.shutdown().await;
    bus.stop().await;
    Ok(())
}

fn run_validate(file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading message dump {}", file.display()))?;
    let message: Message =
        serde_json::from_str(&raw).context("message dump does not parse as a message")?;
    match validate(&message) {
        Ok(()) => {
            println!(
                "ok: {} -> {} [{} {}]",
                message.header.from_role,
                message.header.to_role,
                message.header.kind,
                message.header.priority
            );
            Ok(())
        }
        Err(reason) => anyhow::bail!("invalid message: {reason}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo { messages } => {
            let config = load_config(&cli.config)?;
            run_demo(config, messages).await
        }
        Commands::Validate { file } => run_validate(&file),
    }
}
