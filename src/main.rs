//! # TaskClaw: multi-tenant HTTP cron and chain scheduler
//!
//! Usage:
//!   taskclaw run                         # Scheduler loop + worker gateway
//!   taskclaw migrate                     # Create / upgrade the schema and exit
//!   taskclaw sweep                       # Reset leaked overlap slots once
//!   taskclaw queue show chain <id>       # Inspect a target's overlap queue
//!   taskclaw queue clear cron <id>       # Drop a target's waiting runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taskclaw_core::config::TaskClawConfig;
use taskclaw_core::traits::WorkerQueue;
use taskclaw_core::types::{TaskKind, TaskRef};
use taskclaw_db::StoreHandles;
use taskclaw_scheduler::{EngineServices, MemoryWorkerQueue, SchedulerEngine, StepExecutor, notifier_from_config};

#[derive(Parser)]
#[command(name = "taskclaw", version, about = "⏰ TaskClaw: HTTP cron, delayed task and chain scheduler")]
struct Cli {
    /// Config file (defaults to $TASKCLAW_CONFIG or ~/.taskclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop (and the gateway when enabled)
    Run,
    /// Apply schema migrations and exit
    Migrate,
    /// Run one stale-instance sweep and exit
    Sweep,
    /// Inspect or clear an overlap queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show running instances and waiting entries
    Show {
        /// cron, delayed or chain
        kind: String,
        id: Uuid,
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Remove every waiting entry
    Clear { kind: String, id: Uuid },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "taskclaw=debug,taskclaw_scheduler=debug,taskclaw_db=debug,taskclaw_gateway=debug,tower_http=debug"
    } else {
        "taskclaw=info,taskclaw_scheduler=info,taskclaw_db=info,taskclaw_gateway=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&str>) -> Result<TaskClawConfig> {
    let config = match path {
        Some(p) => {
            let path = PathBuf::from(shellexpand::tilde(p).to_string());
            let mut config = TaskClawConfig::load_from(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            config.apply_env();
            config
        }
        None => TaskClawConfig::load().context("loading config")?,
    };
    config.validate()?;
    Ok(config)
}

fn parse_target(kind: &str, id: Uuid) -> Result<TaskRef> {
    let kind = TaskKind::parse(kind).with_context(|| format!("unknown task kind '{kind}' (cron, delayed, chain)"))?;
    Ok(TaskRef::new(kind, id))
}

fn build_engine(config: &TaskClawConfig, handles: &StoreHandles) -> Result<Arc<SchedulerEngine>> {
    let workers: Arc<dyn WorkerQueue> = match &handles.workers {
        Some(durable) => durable.clone(),
        None => Arc::new(MemoryWorkerQueue::new()),
    };
    let services = EngineServices {
        tasks: handles.tasks.clone(),
        executions: handles.executions.clone(),
        tenants: handles.tenants.clone(),
        workers,
        runner: Arc::new(StepExecutor::new(&config.http)?),
        notifier: notifier_from_config(&config.notify),
        record_body_limit: config.http.max_response_bytes,
    };
    Ok(Arc::new(SchedulerEngine::new(
        &config.scheduler,
        config.notify.failure_threshold,
        services,
    )))
}

async fn run(config: TaskClawConfig, handles: StoreHandles) -> Result<()> {
    let engine = build_engine(&config, &handles)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    println!("⏰ TaskClaw v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Backend:   {}", handles.backend);
    println!("   🆔 Instance:  {}", config.scheduler.instance_id);
    println!("   🧵 Pool size: {}", config.scheduler.worker_pool_size);

    let gateway = if config.gateway.enabled {
        println!("   🌐 Gateway:   http://{}:{}", config.gateway.host, config.gateway.port);
        let state = taskclaw_gateway::AppState::new(engine.clone(), &config.gateway);
        let gateway_config = config.gateway.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = taskclaw_gateway::start(&gateway_config, state, rx).await {
                tracing::error!("❌ Gateway stopped with error: {e}");
            }
        }))
    } else {
        None
    };
    println!();

    let scheduler = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("🛑 Shutdown requested, draining running executions");
    shutdown_tx.send(true).ok();

    scheduler.await.context("scheduler task panicked")?;
    if let Some(gateway) = gateway {
        gateway.await.context("gateway task panicked")?;
    }
    tracing::info!("👋 TaskClaw stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = load_config(cli.config.as_deref())?;
    let handles = taskclaw_db::connect(&config.database)
        .await
        .with_context(|| format!("connecting to {} database", config.database.backend))?;

    match cli.command {
        Command::Run => run(config, handles).await?,
        Command::Migrate => {
            println!("✅ {} schema up to date", handles.backend);
        }
        Command::Sweep => {
            let engine = build_engine(&config, &handles)?;
            let report = engine.sweep().await?;
            engine.dispatcher().wait_idle().await;
            println!(
                "🧹 Reset {} stale target(s), expired {} worker unit(s), resumed {} queued run(s)",
                report.reset, report.expired, report.resumed
            );
        }
        Command::Queue { action } => match action {
            QueueAction::Show { kind, id, limit } => {
                let target = parse_target(&kind, id)?;
                let running = handles.tasks.running_instances(target).await?;
                let depth = handles.tasks.queue_depth(target).await?;
                println!("📋 {target}: {running} running, {depth} queued");
                for entry in handles.tasks.queue_head(target, limit).await? {
                    println!(
                        "   {}  priority={}  queued_at={}  vars={}",
                        entry.id,
                        entry.priority,
                        entry.queued_at.format("%Y-%m-%d %H:%M:%S"),
                        serde_json::to_string(&entry.initial_variables)?
                    );
                }
            }
            QueueAction::Clear { kind, id } => {
                let target = parse_target(&kind, id)?;
                let cleared = handles.tasks.clear_queue(target).await?;
                println!("🧹 Cleared {cleared} queued run(s) of {target}");
            }
        },
    }

    Ok(())
}
