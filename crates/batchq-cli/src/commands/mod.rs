//! CLI command definitions and dispatch.

pub mod jobs;
pub mod migrate;
pub mod status;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use batchq_core::config::AppConfig;
use batchq_core::error::AppError;
use batchq_core::policy::QueuePolicy;
use batchq_database::{DatabasePool, PgJobStore};
use batchq_worker::JobQueue;

use crate::output::{self, OutputFormat};

/// batchq: PostgreSQL-backed batch spec resolution queue
#[derive(Debug, Parser)]
#[command(name = "batchq", version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Database migration management
    Migrate(migrate::MigrateArgs),
    /// Inspect and manage jobs
    Jobs(jobs::JobsArgs),
    /// Reclaim jobs whose workers stopped heartbeating
    ResetStalled,
    /// Show queue counts and effective policy
    Status,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<(), AppError> {
        match &self.command {
            Commands::Migrate(args) => migrate::execute(args, &self.config, self.format).await,
            Commands::Jobs(args) => jobs::execute(args, &self.config, self.format).await,
            Commands::ResetStalled => reset_stalled(&self.config, self.format).await,
            Commands::Status => status::execute(&self.config, self.format).await,
        }
    }
}

/// Run one stalled-job sweep
async fn reset_stalled(config_path: &str, format: OutputFormat) -> Result<(), AppError> {
    let config = load_config(config_path)?;
    let (_db, queue) = create_queue(&config).await?;

    let summary = queue.reset_stalled().await?;
    match format {
        OutputFormat::Table => {
            output::print_success(&format!(
                "Reclaimed {} stalled job(s): {} requeued, {} errored.",
                summary.total(),
                summary.requeued,
                summary.errored
            ));
        }
        OutputFormat::Json => output::print_json(&summary),
    }
    Ok(())
}

/// Helper: load configuration from file
pub fn load_config(config_path: &str) -> Result<AppConfig, AppError> {
    AppConfig::load_file(config_path)
        .map_err(|e| AppError::configuration(format!("Failed to load config: {}", e)))
}

/// Helper: connect to the database
pub async fn create_db_pool(config: &AppConfig) -> Result<DatabasePool, AppError> {
    DatabasePool::connect(&config.database).await
}

/// Helper: build a queue over the PostgreSQL store
pub async fn create_queue(config: &AppConfig) -> Result<(DatabasePool, JobQueue), AppError> {
    let db = create_db_pool(config).await?;
    let store = PgJobStore::new(db.pool().clone(), QueuePolicy::from(&config.queue));
    let queue = JobQueue::new(Arc::new(store), &config.queue);
    Ok((db, queue))
}
