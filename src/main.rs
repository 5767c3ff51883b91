//! batchq server: runs the stalled-job monitor and a worker pool.
//!
//! Main entry point that wires the crates together and runs until Ctrl-C or
//! SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing;
use tracing_subscriber::{EnvFilter, fmt};

use batchq_core::config::AppConfig;
use batchq_core::error::AppError;
use batchq_core::policy::QueuePolicy;
use batchq_database::{DatabasePool, PgJobStore};
use batchq_worker::runner::resolve_hostname;
use batchq_worker::{ExternalCommandHandler, JobQueue, ResetMonitor, WorkerRunner};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from `BATCHQ_CONFIG`, or from `config/` for `BATCHQ_ENV`
fn load_configuration() -> Result<AppConfig, AppError> {
    if let Ok(path) = std::env::var("BATCHQ_CONFIG") {
        return AppConfig::load_file(&path);
    }
    let env = std::env::var("BATCHQ_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting batchq v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Database connection + migrations ─────────────────
    let db = DatabasePool::connect(&config.database).await?;
    batchq_database::migration::run_migrations(db.pool()).await?;

    // ── Step 2: Job queue ────────────────────────────────────────
    let store = PgJobStore::new(db.pool().clone(), QueuePolicy::from(&config.queue));
    let queue = Arc::new(JobQueue::new(Arc::new(store), &config.queue));

    // ── Step 3: Stalled-job monitor ──────────────────────────────
    let monitor = ResetMonitor::new(
        Arc::clone(&queue),
        Duration::from_secs(config.queue.reset_interval_seconds),
    )
    .await?;
    monitor.start().await?;

    // ── Step 4: Worker pool ──────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = if config.worker.enabled {
        let handler = Arc::new(ExternalCommandHandler::new(&config.worker.command)?);
        let hostname = resolve_hostname(&config.worker);
        let runner = WorkerRunner::new(
            Arc::clone(&queue),
            handler,
            config.worker.clone(),
            hostname,
        );
        tracing::info!("Starting worker '{}'...", runner.hostname());
        Some(tokio::spawn(async move {
            runner.run(shutdown_rx).await;
        }))
    } else {
        tracing::info!("Worker disabled; running the reset monitor only");
        None
    };

    // ── Step 5: Wait for shutdown ────────────────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping...");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {}", e);
        }
    }

    monitor.shutdown().await?;
    db.close().await;

    tracing::info!("batchq stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
