use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tasklane_core::{JobRecord, Limit, NetworkRequirement, TasklaneConfig};
use tasklane_scheduler::{JobQueue, JobStore, SqliteJobStore};
use tracing::{info, warn};

mod jobs;

#[derive(Parser)]
#[command(name = "tasklane")]
#[command(about = "Run persistent background jobs with retries and constraints", long_about = None)]
struct Cli {
    /// Config file (default: $TASKLANE_CONFIG, then ~/.tasklane/tasklane.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Restore persisted jobs and run them
    Run {
        /// Exit once every job has finished instead of waiting for Ctrl-C
        #[arg(long)]
        exit_when_idle: bool,
    },
    /// Store a job for the next `run`
    Enqueue {
        /// Registered job type (log, sleep, fail)
        job_type: String,

        /// Job parameter as key=value; values that parse as JSON are kept typed
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        #[arg(long)]
        group: Option<String>,

        #[arg(long)]
        uuid: Option<String>,

        /// Replace a live job holding the same uuid
        #[arg(long)]
        replace: bool,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Seconds to wait before the first run
        #[arg(long, default_value = "0")]
        delay_secs: f64,

        /// Retry budget: a number or "unlimited"
        #[arg(long, default_value = "0")]
        retries: Limit,

        /// Successful runs before the job is done: a number or "unlimited"
        #[arg(long, default_value = "1")]
        max_runs: Limit,

        /// Seconds between periodic runs
        #[arg(long, default_value = "0")]
        interval_secs: f64,

        /// none, any or wifi
        #[arg(long, default_value = "none")]
        network: NetworkRequirement,
    },
    /// List stored jobs
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklane=info,tasklane_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > TASKLANE_CONFIG env > ~/.tasklane/tasklane.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("TASKLANE_CONFIG").ok());
    let config = TasklaneConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TasklaneConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)
        .with_context(|| format!("failed to open database at {db_path}"))?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteJobStore::new(db)?);

    match cli.command {
        Command::Run { exit_when_idle } => run(config, store, exit_when_idle).await,
        Command::Enqueue {
            job_type,
            params,
            group,
            uuid,
            replace,
            tags,
            delay_secs,
            retries,
            max_runs,
            interval_secs,
            network,
        } => {
            let registry = jobs::builtin_registry();
            if !registry.contains(&job_type) {
                bail!(
                    "unknown job type {job_type:?} (known: {})",
                    registry.types().join(", ")
                );
            }

            let mut record = JobRecord::new(job_type)
                .persisted()
                .with_override(replace)
                .with_retry_limit(retries)
                .with_network(network);
            // validate() rejects negative or non-finite values below
            record.delay_secs = delay_secs;
            record.interval_secs = interval_secs;
            record.max_runs = max_runs;
            if let Some(group) = group {
                record = record.with_group(group);
            }
            if let Some(uuid) = uuid {
                record = record.with_uuid(uuid);
            }
            for tag in tags {
                record = record.with_tag(tag);
            }
            for (key, value) in params {
                record = record.with_param(key, value);
            }
            record.validate()?;

            store.save(&record)?;
            info!(job_id = %record.id, job_type = %record.job_type, "job stored");
            println!("{}", record.id);
            Ok(())
        }
        Command::List => {
            for row in store.load_all()? {
                match row.decode() {
                    Ok(record) => println!(
                        "{}  {:<10} group={} runs={}/{} retries={} delay={}s",
                        record.id,
                        record.job_type,
                        record.group,
                        record.run_count,
                        record.max_runs,
                        record.retry_limit,
                        record.delay_secs,
                    ),
                    Err(e) => println!("{}  {:<10} <unreadable: {e}>", row.id, row.job_type),
                }
            }
            Ok(())
        }
    }
}

async fn run(
    config: TasklaneConfig,
    store: Arc<SqliteJobStore>,
    exit_when_idle: bool,
) -> anyhow::Result<()> {
    let queue = JobQueue::builder(config.queue).store(store).build();
    let registry = jobs::builtin_registry();
    let report = queue.rehydrate(&registry)?;
    info!(
        restored = report.restored.len(),
        dropped = report.dropped.len(),
        "job runner started"
    );

    if exit_when_idle {
        queue.wait_idle().await;
        info!("all jobs finished");
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    // Unfinished persisted jobs stay in the store for the next run.
    info!(active = queue.active_count(), "shutting down");
    Ok(())
}

/// `key=value`; the value is parsed as JSON when possible and kept as a
/// string otherwise.
fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in {raw:?}"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
