//! Resolve a batch spec by running an external command.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing;

use batchq_core::error::AppError;
use batchq_entity::job::Job;

use crate::executor::{JobExecutionError, JobHandler};

/// Most output bytes kept in an execution log detail.
const MAX_DETAIL_BYTES: usize = 4096;

/// Runs `program args..` once per job.
///
/// The job is described to the child through `BATCHQ_JOB_ID`,
/// `BATCH_SPEC_ID`, `ALLOW_UNSUPPORTED` and `ALLOW_IGNORED`. Exit status 0
/// is success, any other status a transient failure, and a spawn error a
/// permanent failure. The child is killed if the runner abandons the job.
#[derive(Debug, Clone)]
pub struct ExternalCommandHandler {
    program: String,
    args: Vec<String>,
}

impl ExternalCommandHandler {
    /// Create a handler from a configured command line
    pub fn new(command: &[String]) -> Result<Self, AppError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AppError::configuration("worker.command must name a program"))?;
        if program.trim().is_empty() {
            return Err(AppError::configuration("worker.command must name a program"));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl JobHandler for ExternalCommandHandler {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, job: &Job) -> Result<Option<String>, JobExecutionError> {
        tracing::debug!("Running '{}' for job {}", self.program, job.id);

        let output = Command::new(&self.program)
            .args(&self.args)
            .env("BATCHQ_JOB_ID", job.id.to_string())
            .env("BATCH_SPEC_ID", job.batch_spec_id.to_string())
            .env("ALLOW_UNSUPPORTED", job.allow_unsupported.to_string())
            .env("ALLOW_IGNORED", job.allow_ignored.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                JobExecutionError::Permanent(format!("failed to run '{}': {}", self.program, e))
            })?;

        if output.status.success() {
            let stdout = tail(&output.stdout);
            return Ok((!stdout.is_empty()).then_some(stdout));
        }

        let stderr = tail(&output.stderr);
        let status = match output.status.code() {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        Err(JobExecutionError::Transient(if stderr.is_empty() {
            format!("'{}' failed with {}", self.program, status)
        } else {
            format!("'{}' failed with {}: {}", self.program, status, stderr)
        }))
    }
}

/// Last `MAX_DETAIL_BYTES` of output as trimmed text.
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= MAX_DETAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_DETAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
