//! Job entity model.

use batchq_core::types::{BatchSpecId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::execution_log::ExecutionLogEntry;
use super::state::JobState;

/// One row of `batch_spec_resolution_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Store-assigned identifier, strictly increasing in creation order.
    pub id: JobId,
    /// The batch spec whose workspaces this job resolves.
    pub batch_spec_id: BatchSpecId,
    /// Passed through to the resolver.
    pub allow_unsupported: bool,
    /// Passed through to the resolver.
    pub allow_ignored: bool,
    /// Current lifecycle state.
    pub state: JobState,
    /// Message of the most recent failure or reset that ended an attempt.
    pub failure_message: Option<String>,
    /// When the current or most recent attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job entered a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed (`None` = immediately).
    pub process_after: Option<DateTime<Utc>>,
    /// Number of stalled-lease recoveries.
    pub num_resets: i32,
    /// Number of reported failures.
    pub num_failures: i32,
    /// One entry per concluded attempt.
    #[sqlx(json)]
    pub execution_logs: Vec<ExecutionLogEntry>,
    /// Owning worker while processing, last owner once terminal, empty
    /// while queued.
    pub worker_hostname: String,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Bumped on every mutation and on every heartbeat.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if a worker may claim this job at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.process_after.is_none_or(|after| after <= now)
    }

    /// Check if `worker_hostname` currently holds the lease on this job.
    pub fn is_held_by(&self, worker_hostname: &str) -> bool {
        self.state == JobState::Processing && self.worker_hostname == worker_hostname
    }

    /// Check if the lease has gone without a heartbeat for longer than `timeout`.
    pub fn is_stalled_at(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.state == JobState::Processing && self.updated_at < now - timeout
    }

    /// Number of the attempt currently running, or of the next one.
    pub fn next_attempt(&self) -> i32 {
        self.execution_logs.len() as i32 + 1
    }
}

/// Data required to create a new job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// The batch spec to resolve.
    pub batch_spec_id: BatchSpecId,
    /// Passed through to the resolver.
    #[serde(default)]
    pub allow_unsupported: bool,
    /// Passed through to the resolver.
    #[serde(default)]
    pub allow_ignored: bool,
    /// Initial state, defaults to `queued`. `processing` is rejected.
    #[serde(default)]
    pub state: Option<JobState>,
    /// Defaults to the store's current time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Defaults to `created_at`.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a queued job request for `batch_spec_id`.
    pub fn new(batch_spec_id: BatchSpecId) -> Self {
        Self {
            batch_spec_id,
            ..Default::default()
        }
    }

    /// Set `allow_unsupported`.
    pub fn allow_unsupported(mut self, allow: bool) -> Self {
        self.allow_unsupported = allow;
        self
    }

    /// Set `allow_ignored`.
    pub fn allow_ignored(mut self, allow: bool) -> Self {
        self.allow_ignored = allow;
        self
    }

    /// Override the initial state.
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Override the creation timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// The state the job will be inserted with.
    pub fn initial_state(&self) -> JobState {
        self.state.unwrap_or_default()
    }
}

/// Failure reported by a worker for the job it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Human-readable cause, stored as `failure_message`.
    pub message: String,
    /// Whether the retry policy applies. Non-retryable failures go straight
    /// to `failed`.
    pub retryable: bool,
}

impl JobFailure {
    /// A failure that the retry policy may requeue.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that ends the job immediately.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job_at(state: JobState, updated_at: DateTime<Utc>) -> Job {
        Job {
            id: JobId(1),
            batch_spec_id: BatchSpecId(7),
            allow_unsupported: false,
            allow_ignored: false,
            state,
            failure_message: None,
            started_at: None,
            finished_at: None,
            process_after: None,
            num_resets: 0,
            num_failures: 0,
            execution_logs: Vec::new(),
            worker_hostname: String::new(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_claimable_respects_process_after() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut job = job_at(JobState::Queued, now);
        assert!(job.is_claimable_at(now));

        job.process_after = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_claimable_at(now));
        assert!(job.is_claimable_at(now + chrono::Duration::seconds(30)));

        job.state = JobState::Completed;
        assert!(!job.is_claimable_at(now + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_stalled_only_past_timeout() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut job = job_at(JobState::Processing, now);
        job.worker_hostname = "worker-a".into();

        let timeout = chrono::Duration::seconds(60);
        assert!(!job.is_stalled_at(now + timeout, timeout));
        assert!(job.is_stalled_at(now + timeout + chrono::Duration::seconds(1), timeout));
        assert!(job.is_held_by("worker-a"));
        assert!(!job.is_held_by("worker-b"));
    }

    #[test]
    fn test_new_job_defaults_to_queued() {
        let new = NewJob::new(BatchSpecId(3)).allow_ignored(true);
        assert_eq!(new.initial_state(), JobState::Queued);
        assert!(new.allow_ignored);
        assert!(!new.allow_unsupported);
    }
}
