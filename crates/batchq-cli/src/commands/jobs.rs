//! Job inspection and management commands.

use clap::{Args, Subcommand};

use batchq_core::error::AppError;
use batchq_core::types::{BatchSpecId, JobId};
use batchq_entity::job::{JobLookup, JobState, ListJobsFilter, NewJob};

use crate::output::{self, JobRow, OutputFormat};

/// Arguments for job commands
#[derive(Debug, Args)]
pub struct JobsArgs {
    /// Job subcommand
    #[command(subcommand)]
    pub command: JobsCommand,
}

/// Job subcommands
#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List jobs, oldest first
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,
        /// Only jobs held by (or last held by) this worker
        #[arg(long)]
        worker: Option<String>,
    },
    /// Show one job with its execution log
    Get {
        /// Job ID
        id: Option<JobId>,
        /// Look up by batch spec instead
        #[arg(long)]
        batch_spec: Option<BatchSpecId>,
    },
    /// Enqueue a resolution job for a batch spec
    Create {
        /// Batch spec ID
        batch_spec_id: BatchSpecId,
        /// Allow unsupported code hosts
        #[arg(long)]
        allow_unsupported: bool,
        /// Allow repositories that opted out
        #[arg(long)]
        allow_ignored: bool,
    },
    /// Return a processing job to the queue
    Reset {
        /// Job ID
        id: JobId,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Execute job commands
pub async fn execute(
    args: &JobsArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let config = super::load_config(config_path)?;
    let (_db, queue) = super::create_queue(&config).await?;

    match &args.command {
        JobsCommand::List { state, worker } => {
            let filter = ListJobsFilter {
                state: *state,
                worker_hostname: worker.clone(),
            };
            let jobs = queue.list(&filter).await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
                    output::print_list(&rows, format);
                }
                OutputFormat::Json => output::print_json(&jobs),
            }
        }
        JobsCommand::Get { id, batch_spec } => {
            let lookup = JobLookup {
                id: *id,
                batch_spec_id: *batch_spec,
            };
            if lookup.is_empty() {
                return Err(AppError::validation("Pass a job ID or --batch-spec"));
            }
            let job = queue
                .find(lookup)
                .await?
                .ok_or_else(|| AppError::not_found("No matching job"))?;
            output::print_job(&job, format);
        }
        JobsCommand::Create {
            batch_spec_id,
            allow_unsupported,
            allow_ignored,
        } => {
            let new = NewJob::new(*batch_spec_id)
                .allow_unsupported(*allow_unsupported)
                .allow_ignored(*allow_ignored);
            let job = queue.create(new).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "Created job {} for batch spec {}.",
                        job.id, job.batch_spec_id
                    ));
                }
                OutputFormat::Json => output::print_json(&job),
            }
        }
        JobsCommand::Reset { id, force } => {
            if !force {
                let confirm = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Job {id} may still be running on its worker. Reset it anyway?"
                    ))
                    .default(false)
                    .interact()
                    .map_err(|e| AppError::internal(format!("Input error: {}", e)))?;

                if !confirm {
                    println!("Cancelled.");
                    return Ok(());
                }
            }

            let job = queue.reset(*id).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} is now {}.", job.id, job.state));
                }
                OutputFormat::Json => output::print_json(&job),
            }
        }
    }

    Ok(())
}
