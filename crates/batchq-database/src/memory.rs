//! In-memory job store for tests and local development.
//!
//! All operations run inside one async mutex, so each call is atomic in the
//! same way a single SQL statement is. Timestamps come from an injected
//! [`Clock`], which lets tests move time forward deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use batchq_core::error::AppError;
use batchq_core::policy::{FailureOutcome, QueuePolicy, RESETS_EXHAUSTED_MESSAGE, ResetOutcome};
use batchq_core::result::AppResult;
use batchq_core::traits::{Clock, SystemClock};
use batchq_core::types::JobId;
use batchq_entity::job::{
    AttemptOutcome, ExecutionLogEntry, Job, JobFailure, JobLookup, JobState, ListJobsFilter,
    NewJob, QueueStats, ResetSummary,
};

use crate::store::{
    JobStore, job_not_found, lease_lost, validate_lookup, validate_new_job,
    validate_worker_hostname,
};

/// Detail recorded on entries written by the stalled sweep.
const STALLED_DETAIL: &str = "lease expired without heartbeat";

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    next_id: i64,
}

impl Inner {
    fn insert(&mut self, new: &NewJob, now: DateTime<Utc>) -> Job {
        self.next_id += 1;
        let state = new.initial_state();
        let created_at = new.created_at.unwrap_or(now);
        let updated_at = new.updated_at.unwrap_or(created_at);
        let job = Job {
            id: JobId(self.next_id),
            batch_spec_id: new.batch_spec_id,
            allow_unsupported: new.allow_unsupported,
            allow_ignored: new.allow_ignored,
            state,
            failure_message: None,
            started_at: None,
            finished_at: state.is_terminal().then_some(updated_at),
            process_after: None,
            num_resets: 0,
            num_failures: 0,
            execution_logs: Vec::new(),
            worker_hostname: String::new(),
            created_at,
            updated_at,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    /// Look up a job the worker must hold.
    fn held_mut(&mut self, id: JobId, worker_hostname: &str) -> AppResult<&mut Job> {
        let job = self.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        if !job.is_held_by(worker_hostname) {
            return Err(lease_lost(id, worker_hostname));
        }
        Ok(job)
    }
}

/// Job store holding every row in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
}

impl InMemoryJobStore {
    /// Create an empty store using wall-clock time.
    pub fn new(policy: QueuePolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(policy: QueuePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            policy,
        }
    }

    /// The policy applied by this store.
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Apply the reclaim transition to a processing job.
    fn reclaim(&self, job: &mut Job, now: DateTime<Utc>, detail: &str) -> ResetOutcome {
        append_log(job, now, AttemptOutcome::Reset, Some(detail));
        job.num_resets += 1;
        job.updated_at = now;

        let outcome = self.policy.reset.on_reset(job.num_resets);
        match outcome {
            ResetOutcome::Errored => {
                job.state = JobState::Errored;
                job.failure_message = Some(RESETS_EXHAUSTED_MESSAGE.to_string());
                job.finished_at = Some(now);
            }
            ResetOutcome::Requeue => {
                job.state = JobState::Queued;
                job.worker_hostname.clear();
                job.finished_at = None;
            }
        }
        outcome
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}

/// Record the attempt the job's current holder just concluded.
fn append_log(job: &mut Job, now: DateTime<Utc>, outcome: AttemptOutcome, detail: Option<&str>) {
    let entry = ExecutionLogEntry {
        attempt: job.next_attempt(),
        worker_hostname: job.worker_hostname.clone(),
        started_at: job.started_at.unwrap_or(now),
        finished_at: now,
        outcome,
        detail: detail.map(str::to_string),
    };
    job.execution_logs.push(entry);
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: &NewJob) -> AppResult<Job> {
        validate_new_job(new)?;
        let now = self.clock.now();
        let job = self.inner.lock().await.insert(new, now);
        info!(job_id = %job.id, batch_spec_id = %job.batch_spec_id, state = %job.state, "Job created");
        Ok(job)
    }

    async fn create_many(&self, new: &[NewJob]) -> AppResult<Vec<Job>> {
        for item in new {
            validate_new_job(item)?;
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let jobs: Vec<Job> = new.iter().map(|item| inner.insert(item, now)).collect();
        info!(count = jobs.len(), "Jobs created");
        Ok(jobs)
    }

    async fn get(&self, lookup: JobLookup) -> AppResult<Option<Job>> {
        validate_lookup(&lookup)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .find(|job| {
                lookup.id.is_none_or(|id| job.id == id)
                    && lookup.batch_spec_id.is_none_or(|b| job.batch_spec_id == b)
            })
            .cloned())
    }

    async fn list(&self, filter: &ListJobsFilter) -> AppResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| filter.matches(job.state, &job.worker_hostname))
            .cloned()
            .collect())
    }

    async fn dequeue(&self, worker_hostname: &str) -> AppResult<Option<Job>> {
        validate_worker_hostname(worker_hostname)?;
        // Nothing is mutated until the lock is held, so giving up here
        // leaves every row as it was.
        let mut inner = tokio::time::timeout(self.policy.claim_timeout, self.inner.lock())
            .await
            .map_err(|_| {
                AppError::timeout(format!(
                    "claim did not finish within {}s",
                    self.policy.claim_timeout.as_secs_f64()
                ))
            })?;
        let now = self.clock.now();

        let next = inner
            .jobs
            .values()
            .filter(|job| job.is_claimable_at(now))
            .min_by_key(|job| (job.created_at, job.id))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.state = JobState::Processing;
        job.started_at = Some(now);
        job.updated_at = now;
        job.worker_hostname = worker_hostname.to_string();

        debug!(job_id = %id, worker = worker_hostname, "Job claimed");
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, id: JobId, worker_hostname: &str) -> AppResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.held_mut(id, worker_hostname)?.updated_at = now;
        debug!(job_id = %id, worker = worker_hostname, "Heartbeat recorded");
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: JobId,
        worker_hostname: &str,
        detail: Option<&str>,
    ) -> AppResult<Job> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let job = inner.held_mut(id, worker_hostname)?;

        append_log(job, now, AttemptOutcome::Success, detail);
        job.state = JobState::Completed;
        job.failure_message = None;
        job.finished_at = Some(now);
        job.updated_at = now;

        info!(job_id = %id, worker = worker_hostname, "Job completed");
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_hostname: &str,
        failure: &JobFailure,
    ) -> AppResult<Job> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let job = inner.held_mut(id, worker_hostname)?;

        append_log(job, now, AttemptOutcome::Failure, Some(&failure.message));
        job.num_failures += 1;
        job.failure_message = Some(failure.message.clone());
        job.updated_at = now;

        let outcome = if failure.retryable {
            self.policy.retry.on_failure(job.num_failures, now)
        } else {
            FailureOutcome::Errored
        };
        match outcome {
            FailureOutcome::Requeue { process_after } => {
                job.state = JobState::Queued;
                job.process_after = Some(process_after);
                job.worker_hostname.clear();
            }
            FailureOutcome::Errored => {
                job.state = if failure.retryable {
                    JobState::Errored
                } else {
                    JobState::Failed
                };
                job.finished_at = Some(now);
                job.process_after = None;
            }
        }

        warn!(
            job_id = %id,
            worker = worker_hostname,
            num_failures = job.num_failures,
            state = %job.state,
            error = %failure.message,
            "Job attempt failed"
        );
        Ok(job.clone())
    }

    async fn reset(&self, id: JobId, reason: &str) -> AppResult<Job> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        if job.state != JobState::Processing {
            return Err(AppError::conflict(format!("job {id} is not processing")));
        }

        self.reclaim(job, now, reason);
        warn!(job_id = %id, state = %job.state, num_resets = job.num_resets, reason, "Job reset");
        Ok(job.clone())
    }

    async fn reset_stalled(&self, timeout: Duration) -> AppResult<ResetSummary> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| AppError::validation(format!("heartbeat timeout out of range: {e}")))?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let mut summary = ResetSummary::default();
        for job in inner.jobs.values_mut() {
            if !job.is_stalled_at(now, timeout) {
                continue;
            }
            match self.reclaim(job, now, STALLED_DETAIL) {
                ResetOutcome::Requeue => summary.requeued += 1,
                ResetOutcome::Errored => summary.errored += 1,
            }
            warn!(job_id = %job.id, state = %job.state, "Stalled job reclaimed");
        }
        Ok(summary)
    }

    async fn count_by_state(&self) -> AppResult<QueueStats> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }
}
