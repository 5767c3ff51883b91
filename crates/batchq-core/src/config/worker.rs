//! Worker process configuration.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Background job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether this process claims and executes jobs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of jobs executed concurrently by this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Interval in seconds between polls when the queue is empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Interval in seconds between heartbeats for a running job.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Identity recorded in `worker_hostname`. Generated when absent.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Program and arguments run for every claimed job.
    #[serde(default)]
    pub command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            poll_interval_seconds: default_poll_interval(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            hostname: None,
            command: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub(crate) fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::configuration(
                "worker.concurrency must be at least 1",
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(AppError::configuration(
                "worker.heartbeat_interval_seconds must be at least 1",
            ));
        }
        if matches!(&self.hostname, Some(h) if h.trim().is_empty()) {
            return Err(AppError::configuration("worker.hostname must not be blank"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    10
}
