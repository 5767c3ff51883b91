//! Job queue facade used by submitters, workers and operators.

use std::sync::Arc;

use tracing;

use batchq_core::config::QueueConfig;
use batchq_core::policy::QueuePolicy;
use batchq_core::result::AppResult;
use batchq_core::types::JobId;
use batchq_database::JobStore;
use batchq_entity::job::{
    Job, JobFailure, JobLookup, ListJobsFilter, NewJob, QueueStats, ResetSummary,
};

/// Reason recorded when an operator resets a job by hand.
pub const OPERATOR_RESET_REASON: &str = "reset by operator";

/// Job queue over a [`JobStore`]
#[derive(Debug, Clone)]
pub struct JobQueue {
    /// Backing store
    store: Arc<dyn JobStore>,
    /// Retry, reset and lease policy
    policy: QueuePolicy,
}

impl JobQueue {
    /// Create a new job queue
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            policy: QueuePolicy::from(config),
        }
    }

    /// The policy in effect
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Submit a job
    pub async fn create(&self, new: NewJob) -> AppResult<Job> {
        let job = self.store.create(&new).await?;
        tracing::debug!(
            "Enqueued job: id={}, batch_spec_id={}",
            job.id,
            job.batch_spec_id
        );
        Ok(job)
    }

    /// Submit several jobs atomically
    pub async fn create_many(&self, new: &[NewJob]) -> AppResult<Vec<Job>> {
        self.store.create_many(new).await
    }

    /// Claim the next eligible job for `worker_hostname`.
    ///
    /// The store enforces the claim timeout: a claim that outlives it fails
    /// with a transient `Timeout` error and leaves the queue unchanged.
    pub async fn claim(&self, worker_hostname: &str) -> AppResult<Option<Job>> {
        let job = self.store.dequeue(worker_hostname).await?;

        if let Some(job) = &job {
            debug_assert!(
                job.is_held_by(worker_hostname),
                "claimed job {} is not processing for {worker_hostname}",
                job.id
            );
            tracing::debug!("Claimed job {} for worker '{}'", job.id, worker_hostname);
        }
        Ok(job)
    }

    /// Report that the worker finished the job
    pub async fn report_success(
        &self,
        id: JobId,
        worker_hostname: &str,
        detail: Option<&str>,
    ) -> AppResult<Job> {
        self.store.mark_completed(id, worker_hostname, detail).await
    }

    /// Report that the worker's attempt failed
    pub async fn report_failure(
        &self,
        id: JobId,
        worker_hostname: &str,
        failure: &JobFailure,
    ) -> AppResult<Job> {
        self.store.mark_failed(id, worker_hostname, failure).await
    }

    /// Refresh the worker's lease
    pub async fn heartbeat(&self, id: JobId, worker_hostname: &str) -> AppResult<()> {
        self.store.heartbeat(id, worker_hostname).await
    }

    /// Get a job by ID
    pub async fn get(&self, id: JobId) -> AppResult<Option<Job>> {
        self.store.get_by_id(id).await
    }

    /// Get a job by ID and/or batch spec
    pub async fn find(&self, lookup: JobLookup) -> AppResult<Option<Job>> {
        self.store.get(lookup).await
    }

    /// List jobs
    pub async fn list(&self, filter: &ListJobsFilter) -> AppResult<Vec<Job>> {
        self.store.list(filter).await
    }

    /// Return a processing job to the queue regardless of its heartbeat
    pub async fn reset(&self, id: JobId) -> AppResult<Job> {
        self.store.reset(id, OPERATOR_RESET_REASON).await
    }

    /// Reclaim every job whose lease has expired
    pub async fn reset_stalled(&self) -> AppResult<ResetSummary> {
        let summary = self
            .store
            .reset_stalled(self.policy.heartbeat_timeout)
            .await?;
        if summary.total() > 0 {
            tracing::info!(
                "Reclaimed stalled jobs: requeued={}, errored={}",
                summary.requeued,
                summary.errored
            );
        }
        Ok(summary)
    }

    /// Job counts per state
    pub async fn stats(&self) -> AppResult<QueueStats> {
        self.store.count_by_state().await
    }
}
