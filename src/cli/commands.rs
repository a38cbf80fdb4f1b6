//! CLI command definitions.
//!
//! Every command is one supervisor-driven iteration: `worker` takes and
//! runs at most one task, `status` prints a one-shot snapshot of the
//! monitoring stores, `check` probes the transport. Long-running
//! behavior comes from an external supervisor (systemd, a shell loop)
//! restarting the process, not from looping here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::info;

use crate::broker::{BatchReader, Consumer, Producer, RedisTransport};
use crate::monitor::{
    classify_worker, TaskStore, WorkerStateStore, TASK_STORE_CAPACITY, WORKER_STORE_CAPACITY,
};
use crate::worker::{Worker, WorkerConfig};

/// Distributed task queue over Redis Streams.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Distributed task queue over Redis Streams")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Take at most one task from the queue and run it.
    Worker(WorkerArgs),

    /// Print a one-shot snapshot of task and worker state as JSON.
    Status(StatusArgs),

    /// Probe the stream transport and exit non-zero if it is down.
    Check(CheckArgs),
}

/// Arguments for `taskforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Redis connection URL.
    #[arg(long, env = "TASKFORGE_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Stream tasks are taken from; doubles as the task group id in
    /// every record this worker emits.
    #[arg(long)]
    pub task_stream: String,

    /// Consumer group shared by the workers of this task stream.
    #[arg(long, default_value = "workers")]
    pub group: String,

    /// Stream status records are reported to.
    #[arg(long)]
    pub update_stream: String,

    /// Stream worker-state records are reported to.
    #[arg(long)]
    pub state_stream: String,

    /// Stable worker identity. A restarted worker resumes its pending
    /// task only under the same identity.
    #[arg(long, env = "TASKFORGE_WORKER_ID")]
    pub worker_id: String,

    /// Directory task subprocesses run in.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Directory task artifacts are written under.
    #[arg(long)]
    pub artifacts_root: Option<PathBuf>,

    /// Public URL prefix under which the artifacts root is served.
    #[arg(long)]
    pub artifacts_url: Option<String>,

    /// Task timeout in seconds.
    #[arg(long, default_value_t = 3600)]
    pub task_timeout_secs: u64,
}

/// Arguments for `taskforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Redis connection URL.
    #[arg(long, env = "TASKFORGE_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Update stream(s) to aggregate task status from; repeatable.
    #[arg(long = "update-stream", required = true)]
    pub update_streams: Vec<String>,

    /// Stream worker-state records are read from.
    #[arg(long)]
    pub state_stream: String,

    /// Most recent tasks kept per snapshot.
    #[arg(long, default_value_t = TASK_STORE_CAPACITY)]
    pub task_capacity: usize,

    /// Most recent workers kept per snapshot.
    #[arg(long, default_value_t = WORKER_STORE_CAPACITY)]
    pub worker_capacity: usize,
}

/// Arguments for `taskforge check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Redis connection URL.
    #[arg(long, env = "TASKFORGE_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker(args).await,
        Commands::Status(args) => run_status(args).await,
        Commands::Check(args) => run_check(args).await,
    }
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let transport = Arc::new(RedisTransport::connect(&args.redis_url).await?);
    let consumer = Consumer::register(
        transport.clone(),
        &args.task_stream,
        &args.group,
        &args.worker_id,
    )
    .await?;
    let updates = Producer::new(transport.clone(), &args.update_stream);
    let states = Producer::new(transport, &args.state_stream);

    let mut config = WorkerConfig::new(&args.worker_id)
        .with_task_timeout(Duration::from_secs(args.task_timeout_secs));
    if let Some(run_dir) = args.run_dir {
        config = config.with_run_dir(run_dir);
    }
    if let Some(artifacts_root) = args.artifacts_root {
        config = config.with_artifacts_root(artifacts_root);
    }
    if let Some(artifacts_url) = args.artifacts_url {
        config = config.with_artifacts_base_url(artifacts_url);
    }

    let mut worker = Worker::new(config, consumer, updates, states);
    worker.run_single_task().await?;
    Ok(())
}

async fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    let transport = Arc::new(RedisTransport::connect(&args.redis_url).await?);

    let task_store = TaskStore::new(args.task_capacity);
    let mut task_readers: Vec<BatchReader> = args
        .update_streams
        .iter()
        .map(|stream| BatchReader::new(transport.clone(), stream, args.task_capacity))
        .collect();
    task_store.refresh(&mut task_readers).await?;

    let worker_store = WorkerStateStore::new(args.worker_capacity);
    let mut state_reader =
        BatchReader::new(transport, &args.state_stream, args.worker_capacity);
    worker_store.refresh(&mut state_reader).await?;

    let now = chrono::Utc::now();
    let workers: serde_json::Map<String, serde_json::Value> = worker_store
        .list()
        .await
        .into_iter()
        .map(|(group, records)| {
            let states: Vec<serde_json::Value> = records
                .into_iter()
                .map(|record| {
                    let health = classify_worker(&record, now);
                    json!({"health": health, "state": record})
                })
                .collect();
            (group, serde_json::Value::Array(states))
        })
        .collect();

    let snapshot = json!({
        "tasks": task_store.list().await,
        "workers": workers,
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let transport = RedisTransport::connect(&args.redis_url).await?;
    if !crate::broker::StreamTransport::is_alive(&transport).await {
        anyhow::bail!("stream transport at {} is not answering", args.redis_url);
    }
    info!(redis_url = %args.redis_url, "Stream transport is alive");
    println!("alive");
    Ok(())
}
