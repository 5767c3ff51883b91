//! Execution log entries: one immutable record per concluded attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a claim/execution cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The worker reported success.
    Success,
    /// The worker reported a failure.
    Failure,
    /// The lease expired or an operator reset the job.
    Reset,
}

/// Record of one attempt. Stored as an element of the `execution_logs`
/// JSONB array; entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// 1-based attempt number on this job.
    pub attempt: i32,
    /// Worker that held the job during the attempt.
    pub worker_hostname: String,
    /// When the attempt was claimed.
    pub started_at: DateTime<Utc>,
    /// When the attempt concluded.
    pub finished_at: DateTime<Utc>,
    /// How it concluded.
    pub outcome: AttemptOutcome,
    /// Free-text detail: worker output, failure cause, or reset reason.
    #[serde(default)]
    pub detail: Option<String>,
}

impl ExecutionLogEntry {
    /// Attempt duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }
}
