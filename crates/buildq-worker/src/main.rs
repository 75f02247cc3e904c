//! buildq worker process
//!
//! Consumes start/stop build jobs from Redis and dispatches them to the
//! configured executors until SIGTERM or Ctrl-C.

use anyhow::Context;
use buildq_config::{ServiceConfig, load_service_config};
use buildq_redis::{RedisBroker, RedisKvStore};
use buildq_scheduler::events::{self, spawn_scheduler_event_handler, spawn_worker_event_handler};
use buildq_scheduler::{
    BuildConfigStore, FailureNotifier, HttpStatusApi, JobRegistry, PoolConfig, RetryPolicy,
    Scheduler, SchedulerConfig, ShutdownCoordinator, WorkerPool,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EVENT_BUFFER: usize = 1024;
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "buildq-worker")]
#[command(about = "Queue worker that launches and stops builds", long_about = None)]
struct Cli {
    /// Path to the KDL service configuration
    #[arg(short, long, env = "BUILDQ_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "BUILDQ_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_service_config(cli.config.as_deref()).context("loading configuration")?;
    let exit_code = run(config).await?;
    std::process::exit(exit_code);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: ServiceConfig) -> anyhow::Result<i32> {
    info!(
        host = %config.redis.host,
        port = config.redis.port,
        "Connecting to Redis..."
    );
    let conn = buildq_redis::connect(&config.redis).await?;
    let broker = Arc::new(RedisBroker::new(conn.clone()));
    let store = BuildConfigStore::new(
        Arc::new(RedisKvStore::new(conn)),
        config.redis.build_configs_key(),
    );

    let executor = Arc::new(buildq_executor::router_from_settings(&config.executor).await?);
    let registry = JobRegistry::builds(
        store,
        executor,
        RetryPolicy::from_settings(&config.retry),
    );

    let status_api = HttpStatusApi::new(config.status_api.timeout())?;
    let notifier = Arc::new(FailureNotifier::new(Arc::new(status_api)));
    let (worker_events, worker_rx) = events::channel(EVENT_BUFFER);
    let worker_handler = spawn_worker_event_handler(worker_rx, Some(notifier));

    let queue = config.redis.queue_name();
    let pool = Arc::new(WorkerPool::new(
        PoolConfig::from_settings(&config.worker, vec![queue.clone()]),
        broker.clone(),
        Arc::new(registry),
        worker_events,
    ));

    let mut scheduler_handler = None;
    let coordinator = if config.scheduler.enabled {
        let (scheduler_events, scheduler_rx) = events::channel(EVENT_BUFFER);
        scheduler_handler = Some(spawn_scheduler_event_handler(scheduler_rx));

        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from_settings(&config.scheduler),
            broker,
            scheduler_events,
        ));
        if let Err(e) = scheduler.connect().await {
            warn!(error = %e, "Scheduler could not reach Redis, will keep polling");
        }
        scheduler.start().await?;
        pool.start().await?;
        ShutdownCoordinator::new(pool, scheduler)
    } else {
        pool.start().await?;
        ShutdownCoordinator::single(pool)
    };

    info!(queue = %queue, "Worker running");
    let outcome = coordinator.run_until_signal().await;

    // Dropping the components closes the event channels so the handlers
    // can flush outstanding failure reports.
    drop(coordinator);
    if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, worker_handler)
        .await
        .is_err()
    {
        warn!("Timed out flushing worker events");
    }
    if let Some(handler) = scheduler_handler {
        let _ = tokio::time::timeout(EVENT_FLUSH_TIMEOUT, handler).await;
    }

    Ok(outcome.exit_code())
}
