//! Job worker process: reconciles configured jobs, then consumes queues and
//! (optionally) schedules system jobs until interrupted.

mod config;
mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use platform_core::{SharedClock, SystemClock};
use platform_infra::PostgresJobStore;
use platform_jobs::{InMemoryJobStore, Jobs, JobsBuilder, SharedJobStore};
use platform_observability::LogFormat;

use crate::config::WorkerConfig;
use crate::handlers::{EXECUTION_RETENTION, ExecutionRetention, HEARTBEAT, Heartbeat};

#[derive(Parser)]
#[command(name = "platform-worker")]
#[command(about = "Distributed, versioned job runner")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "JOBS_CONFIG", default_value = "config/jobs.toml")]
    config: PathBuf,

    /// Postgres URL; overrides the config file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL; overrides the config file
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Consume queues only; leave scheduling to other replicas
    #[arg(long)]
    no_scheduler: bool,

    /// Human-readable logs
    #[arg(long)]
    pretty: bool,

    /// Name of this worker in logs
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = WorkerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }
    if cli.redis_url.is_some() {
        config.redis_url = cli.redis_url.clone();
    }
    if cli.no_scheduler {
        config.disable_scheduler = true;
    }

    platform_observability::init_with(if cli.pretty {
        LogFormat::Pretty
    } else {
        config.log_format
    });

    let clock = SystemClock::shared();
    let store = connect_store(&config).await?;
    let mut builder = Jobs::builder(config.jobs.clone())
        .store(store.clone())
        .clock(clock.clone());
    if let Some(worker_id) = cli.worker_id {
        builder = builder.worker_id(worker_id);
    }
    builder = connect_redis(builder, &config, clock.clone()).await?;
    builder = register_handlers(builder, &config, store, clock);

    let jobs = builder.build().await?;
    let report = jobs.initialize().await?;
    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        disabled = report.disabled.len(),
        "jobs reconciled"
    );

    let handle = jobs.start(!config.disable_scheduler);
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutdown requested");
    let stats = handle.stats();
    handle.shutdown().await;
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        uptime_secs = stats.uptime_secs,
        "worker stopped"
    );
    Ok(())
}

async fn connect_store(config: &WorkerConfig) -> anyhow::Result<SharedJobStore> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url)
                .await
                .context("connecting to Postgres")?;
            store.ensure_schema().await.context("creating job tables")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database_url configured; job state is kept in memory");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(
    builder: JobsBuilder,
    config: &WorkerConfig,
    clock: SharedClock,
) -> anyhow::Result<JobsBuilder> {
    use platform_infra::{RedisJobQueue, RedisLockProvider};

    let Some(url) = &config.redis_url else {
        warn!("no redis_url configured; locks and queues are process-local");
        return Ok(builder);
    };
    let locks = RedisLockProvider::connect(url, config.redis_prefix.clone())
        .await
        .context("connecting lock provider to Redis")?;
    let queue = RedisJobQueue::connect(url, config.redis_prefix.clone(), clock)
        .await
        .context("connecting job queue to Redis")?;
    Ok(builder.locks(Arc::new(locks)).queue(Arc::new(queue)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    builder: JobsBuilder,
    config: &WorkerConfig,
    _clock: SharedClock,
) -> anyhow::Result<JobsBuilder> {
    if config.redis_url.is_some() {
        warn!("built without the redis feature; redis_url ignored");
    }
    Ok(builder)
}

/// Attach the built-in handlers for every configured job that names one.
fn register_handlers(
    mut builder: JobsBuilder,
    config: &WorkerConfig,
    store: SharedJobStore,
    clock: SharedClock,
) -> JobsBuilder {
    for job in config.jobs.all_jobs() {
        match job.name.as_str() {
            EXECUTION_RETENTION => {
                builder = builder.handler(
                    EXECUTION_RETENTION,
                    ExecutionRetention::new(
                        store.clone(),
                        clock.clone(),
                        config.retention.execution_retention(),
                    ),
                );
            }
            HEARTBEAT => builder = builder.handler(HEARTBEAT, Heartbeat),
            _ => {}
        }
    }
    builder
}
