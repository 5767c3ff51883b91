//! Queue status overview.

use serde::Serialize;

use batchq_core::config::{QueueConfig, WorkerConfig};
use batchq_core::error::AppError;
use batchq_entity::job::{JobState, QueueStats};

use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    jobs: QueueStats,
    queue: &'a QueueConfig,
    worker: &'a WorkerConfig,
}

/// Show per-state counts and the configured policy
pub async fn execute(config_path: &str, format: OutputFormat) -> Result<(), AppError> {
    let config = super::load_config(config_path)?;
    let (db, queue) = super::create_queue(&config).await?;
    db.health_check().await?;
    let stats = queue.stats().await?;

    if format == OutputFormat::Json {
        output::print_json(&StatusReport {
            jobs: stats,
            queue: &config.queue,
            worker: &config.worker,
        });
        return Ok(());
    }

    println!("Queue Status:");
    for state in JobState::ALL {
        output::print_kv(state.as_str(), &stats.get(state).to_string());
    }
    output::print_kv("total", &stats.total().to_string());

    println!();
    println!("Policy:");
    output::print_kv("Max Failures", &config.queue.max_failures.to_string());
    output::print_kv("Max Resets", &config.queue.max_resets.to_string());
    output::print_kv(
        "Heartbeat Timeout",
        &format!("{}s", config.queue.heartbeat_timeout_seconds),
    );
    output::print_kv(
        "Backoff",
        &format!(
            "{:?} base={}s max={}s",
            config.queue.backoff.strategy,
            config.queue.backoff.base_seconds,
            config.queue.backoff.max_seconds
        ),
    );
    output::print_kv("Worker Enabled", &config.worker.enabled.to_string());
    output::print_kv("Concurrency", &config.worker.concurrency.to_string());

    Ok(())
}
