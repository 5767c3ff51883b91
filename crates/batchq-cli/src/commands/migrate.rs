//! Database migration management commands.

use clap::{Args, Subcommand};
use tabled::Tabled;

use batchq_core::error::AppError;
use batchq_database::migration::{self, MigrationStatus};
use serde::Serialize;

use crate::output::{self, OutputFormat};

/// Arguments for the migrate command
#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Migration subcommand
    #[command(subcommand)]
    pub command: MigrateCommand,
}

/// Migration subcommands
#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Run all pending migrations
    Run,
    /// Show migration status
    Status,
    /// Drop the job table and re-run every migration
    Reset {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct MigrationRow {
    #[tabled(rename = "Version")]
    version: i64,
    #[tabled(rename = "Description")]
    description: String,
    #[tabled(rename = "Applied")]
    applied: bool,
}

impl From<MigrationStatus> for MigrationRow {
    fn from(status: MigrationStatus) -> Self {
        Self {
            version: status.version,
            description: status.description,
            applied: status.applied,
        }
    }
}

/// Execute migration commands
pub async fn execute(
    args: &MigrateArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let config = super::load_config(config_path)?;
    let db = super::create_db_pool(&config).await?;

    match &args.command {
        MigrateCommand::Run => {
            println!("Running database migrations...");
            migration::run_migrations(db.pool()).await?;
            output::print_success("All migrations applied successfully.");
        }
        MigrateCommand::Status => {
            let rows: Vec<MigrationRow> = migration::migration_status(db.pool())
                .await?
                .into_iter()
                .map(MigrationRow::from)
                .collect();
            output::print_list(&rows, format);
        }
        MigrateCommand::Reset { force } => {
            if !force {
                let confirm = dialoguer::Confirm::new()
                    .with_prompt("This will DROP every job and re-run migrations. Continue?")
                    .default(false)
                    .interact()
                    .map_err(|e| AppError::internal(format!("Input error: {}", e)))?;

                if !confirm {
                    println!("Cancelled.");
                    return Ok(());
                }
            }

            println!("Resetting database...");
            migration::reset_database(db.pool()).await?;
            output::print_success("Database reset complete.");
        }
    }

    Ok(())
}
