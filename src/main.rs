//! # Cadence: demo host
//!
//! Runs heartbeat tasks on the scheduler or on a timer-driven task collection
//! and prints the resulting task states as JSON.
//!
//! Usage:
//!   cadence schedule --seconds 5 --tasks 3    # Scheduler dispatch loop
//!   cadence ticks --seconds 5 --tasks 3       # Periodic timer + task collection
//!   cadence config --init                     # Write default config

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cadence_core::{CadenceConfig, MonotonicClock, SharedClock, TimeSpan};
use cadence_scheduler::{
    Cancelled, CompletionParams, InvocationParams, PeriodicTimer, ScheduledTask, Scheduler,
    TaskCollection, TaskContext, TickTask,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "⏱️ Cadence: timestamp-driven task scheduler")]
struct Cli {
    /// Config file (default: ~/.cadence/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run heartbeat tasks on the scheduler
    Schedule {
        #[arg(long, default_value = "5")]
        seconds: u64,
        #[arg(long, default_value = "3")]
        tasks: usize,
        /// Simulated work per invocation
        #[arg(long, default_value = "50")]
        work_ms: u64,
    },
    /// Drive heartbeat tasks from the periodic timer
    Ticks {
        #[arg(long, default_value = "5")]
        seconds: u64,
        #[arg(long, default_value = "3")]
        tasks: usize,
        #[arg(long, default_value = "50")]
        work_ms: u64,
    },
    /// Show the effective configuration
    Config {
        /// Write it to the config path
        #[arg(long)]
        init: bool,
    },
}

/// Demo task: logs and sleeps for its work span.
struct Heartbeat {
    key: String,
    work: Duration,
    max_concurrent: usize,
    max_enqueued: usize,
}

#[async_trait]
impl ScheduledTask for Heartbeat {
    fn key(&self) -> &str {
        &self.key
    }

    fn max_concurrent_invocations(&self) -> usize {
        self.max_concurrent
    }

    fn max_enqueued_invocations(&self) -> usize {
        self.max_enqueued
    }

    async fn invoke(
        &self,
        _ctx: TaskContext,
        params: InvocationParams,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(
            "💓 {} #{} (due {}, late {})",
            self.key,
            params.invocation_id,
            params.original_timestamp,
            params.invocation_timestamp - params.original_timestamp
        );
        tokio::select! {
            _ = tokio::time::sleep(self.work) => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled.into()),
        }
    }

    fn on_completed(&self, _ctx: &TaskContext, completion: &CompletionParams) -> anyhow::Result<()> {
        if let Some(reason) = completion.cancellation {
            tracing::debug!("{} #{} cancelled: {reason:?}", self.key, completion.invocation.invocation_id);
        }
        Ok(())
    }
}

fn heartbeats(config: &CadenceConfig, count: usize, work_ms: u64) -> Vec<Arc<Heartbeat>> {
    (1..=count)
        .map(|i| {
            Arc::new(Heartbeat {
                key: format!("heartbeat-{i}"),
                work: Duration::from_millis(work_ms),
                max_concurrent: config.scheduler.default_max_concurrent,
                max_enqueued: config.scheduler.default_max_enqueued,
            })
        })
        .collect()
}

fn load_config(path: Option<&str>) -> Result<CadenceConfig> {
    let config = match path {
        Some(p) => CadenceConfig::load_from(std::path::Path::new(&*shellexpand::tilde(p)))?,
        None => CadenceConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Initialize logging
    let filter = if cli.verbose {
        "cadence=debug,cadence_scheduler=debug".to_string()
    } else {
        config.log.filter.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    match cli.command {
        Commands::Schedule { seconds, tasks, work_ms } => {
            run_scheduler(&config, seconds, tasks, work_ms).await
        }
        Commands::Ticks { seconds, tasks, work_ms } => {
            run_ticks(&config, seconds, tasks, work_ms).await
        }
        Commands::Config { init } => {
            if init {
                let path = cli
                    .config
                    .as_deref()
                    .map(|p| std::path::PathBuf::from(&*shellexpand::tilde(p)))
                    .unwrap_or_else(CadenceConfig::default_path);
                config.save_to(&path)?;
                println!("✅ Config written to {}", path.display());
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(())
        }
    }
}

async fn run_scheduler(config: &CadenceConfig, seconds: u64, tasks: usize, work_ms: u64) -> Result<()> {
    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let scheduler = Scheduler::with_config(Arc::clone(&clock), config.scheduler.clone());
    let run = scheduler.start_async();

    let tasks = heartbeats(config, tasks, work_ms);
    let start = clock.now();
    for (i, task) in tasks.iter().enumerate() {
        let interval = config.timer.interval() * (i as i64 + 1);
        scheduler.schedule_infinite(task.clone(), start + interval, interval)?;
    }
    println!("⏱️ Scheduler running {} task(s) for {seconds}s", tasks.len());

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let states: Vec<_> = scheduler
        .task_keys()
        .iter()
        .filter_map(|key| scheduler.try_get_task_state(key))
        .collect();
    scheduler.dispose().await?;
    run.await?;

    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}

async fn run_ticks(config: &CadenceConfig, seconds: u64, tasks: usize, work_ms: u64) -> Result<()> {
    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let timer = PeriodicTimer::from_config(Arc::clone(&clock), &config.timer)?;

    let tasks = heartbeats(config, tasks, work_ms);
    let members = tasks
        .iter()
        .enumerate()
        .map(|(i, task)| {
            TickTask::new(task.clone() as Arc<dyn ScheduledTask>)
                .every(config.timer.interval() * (i as i64 + 1))
        })
        .collect();
    let collection = TaskCollection::register(Arc::clone(&clock), timer.subscribe(), members)?;
    let run = timer.start_async(TimeSpan::ZERO);
    println!("⏱️ Timer driving {} task(s) for {seconds}s", tasks.len());

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let states: Vec<_> = collection
        .task_keys()
        .iter()
        .filter_map(|key| collection.try_get_task_state(key))
        .collect();
    let ticks = timer.ticks_emitted();
    timer.dispose();
    run.await?;
    collection.dispose().await?;

    println!("{}", serde_json::to_string_pretty(&states)?);
    println!(
        "📡 {ticks} tick(s) emitted, {} observed",
        collection.statistics().event_count
    );
    Ok(())
}
