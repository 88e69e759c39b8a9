mod config;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use taskq_broker::Broker;
use taskq_core::manager::QueueManager;
use taskq_core::pool::{PoolConfig, WorkerPoolSupervisor};
use taskq_core::SystemClock;
use taskq_db::pool;

use config::TaskQConfig;

#[derive(Parser)]
#[command(name = "taskq", about = "background task queue worker runner")]
struct Cli {
    /// Metadata store URL (overrides TASKQ_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Broker URL (overrides TASKQ_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a worker pool against a queue.
    RunWorker {
        /// Queue name to consume.
        #[arg(long)]
        queue: String,
        /// Number of concurrent workers in the pool.
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Stop after this many tasks have been processed.
        #[arg(long)]
        max_tasks: Option<u64>,
        /// Seconds to wait between polls when the queue is idle.
        #[arg(long, default_value_t = 1)]
        poll_interval: u64,
        /// Seconds a `processing` task can run before it is presumed
        /// abandoned and reclaimed.
        #[arg(long, default_value_t = 300)]
        processing_timeout: i64,
        /// Seconds given to in-flight attempts to finish on shutdown.
        #[arg(long, default_value_t = 30)]
        shutdown_grace: u64,
        /// Log level (trace, debug, info, warn, error).
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Print the names of registered task handlers.
    ListTasks,
}

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_UNRECOVERABLE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::RunWorker { log_level, .. } => log_level.clone(),
        Commands::ListTasks => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let code = match cli.command {
        Commands::ListTasks => cmd_list_tasks(),
        Commands::RunWorker {
            queue,
            workers,
            max_tasks,
            poll_interval,
            processing_timeout,
            shutdown_grace,
            ..
        } => {
            cmd_run_worker(
                cli.database_url.as_deref(),
                cli.redis_url.as_deref(),
                queue,
                workers,
                max_tasks,
                poll_interval,
                processing_timeout,
                shutdown_grace,
            )
            .await
        }
    };

    std::process::exit(code);
}

fn cmd_list_tasks() -> i32 {
    let registry = handlers::build_registry();
    let mut names = registry.list();
    names.sort();
    for name in names {
        println!("{name}");
    }
    0
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run_worker(
    cli_db_url: Option<&str>,
    cli_redis_url: Option<&str>,
    queue: String,
    workers: usize,
    max_tasks: Option<u64>,
    poll_interval_secs: u64,
    processing_timeout_secs: i64,
    shutdown_grace_secs: u64,
) -> i32 {
    if workers == 0 {
        eprintln!("--workers must be at least 1");
        return EXIT_CONFIG_ERROR;
    }

    let resolved = TaskQConfig::resolve(cli_db_url, cli_redis_url);

    let db_pool = match pool::create_pool(&resolved.db_config).await {
        Ok(p) => p,
        Err(err) => {
            eprintln!("failed to connect to metadata store: {err:#}");
            return EXIT_UNRECOVERABLE;
        }
    };

    let broker = match Broker::connect(&resolved.broker_config).await {
        Ok(b) => b,
        Err(err) => {
            eprintln!("failed to connect to broker: {err:#}");
            db_pool.close().await;
            return EXIT_UNRECOVERABLE;
        }
    };

    let manager = Arc::new(QueueManager::new(
        db_pool.clone(),
        Arc::new(broker),
        Arc::new(SystemClock),
    ));
    let registry = Arc::new(handlers::build_registry());

    let config = PoolConfig {
        queue_name: queue.clone(),
        worker_count: workers,
        max_tasks,
        poll_interval: Duration::from_secs(poll_interval_secs),
        processing_timeout: ChronoDuration::seconds(processing_timeout_secs),
        shutdown_grace: Duration::from_secs(shutdown_grace_secs),
    };

    let supervisor = WorkerPoolSupervisor::new(config, manager, registry);
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining in-flight tasks");
            shutdown_signal.cancel();
        }
    });

    let outcome = supervisor.run(shutdown).await;
    db_pool.close().await;

    info!(queue = %queue, ?outcome, "worker pool exited");
    match outcome {
        taskq_core::pool::PoolOutcome::Fatal(message) => {
            eprintln!("worker pool aborted: {message}");
            EXIT_UNRECOVERABLE
        }
        taskq_core::pool::PoolOutcome::MaxTasksReached
        | taskq_core::pool::PoolOutcome::ShutdownClean
        | taskq_core::pool::PoolOutcome::ShutdownForced => 0,
    }
}
