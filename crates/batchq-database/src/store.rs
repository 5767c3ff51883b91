//! The job store abstraction shared by the PostgreSQL and in-memory backends.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use batchq_core::error::AppError;
use batchq_core::result::AppResult;
use batchq_core::types::JobId;
use batchq_entity::job::{
    Job, JobFailure, JobLookup, JobState, ListJobsFilter, NewJob, QueueStats, ResetSummary,
};

/// Durable storage for batch spec resolution jobs.
///
/// Every mutating method is a single atomic step: either one statement or
/// one row-locked transaction in PostgreSQL, or one critical section in
/// memory. Callers never observe a row with inconsistent state and
/// timestamps.
#[async_trait]
pub trait JobStore: Send + Sync + fmt::Debug {
    /// Insert a job. State defaults to `queued`, timestamps to now.
    async fn create(&self, new: &NewJob) -> AppResult<Job>;

    /// Insert several jobs atomically, returned in insertion order.
    async fn create_many(&self, new: &[NewJob]) -> AppResult<Vec<Job>>;

    /// Fetch one job by id and/or batch spec id. The lowest id wins when the
    /// lookup matches several rows.
    async fn get(&self, lookup: JobLookup) -> AppResult<Option<Job>>;

    /// Fetch one job by id.
    async fn get_by_id(&self, id: JobId) -> AppResult<Option<Job>> {
        self.get(JobLookup::by_id(id)).await
    }

    /// List jobs matching every set filter, ordered by ascending id.
    async fn list(&self, filter: &ListJobsFilter) -> AppResult<Vec<Job>>;

    /// Claim the oldest eligible queued job for `worker_hostname`.
    async fn dequeue(&self, worker_hostname: &str) -> AppResult<Option<Job>>;

    /// Refresh the lease on a job the worker holds.
    async fn heartbeat(&self, id: JobId, worker_hostname: &str) -> AppResult<()>;

    /// Finish a held job successfully.
    async fn mark_completed(
        &self,
        id: JobId,
        worker_hostname: &str,
        detail: Option<&str>,
    ) -> AppResult<Job>;

    /// Record a failed attempt on a held job and apply the retry policy.
    async fn mark_failed(
        &self,
        id: JobId,
        worker_hostname: &str,
        failure: &JobFailure,
    ) -> AppResult<Job>;

    /// Reclaim one processing job regardless of its heartbeat age.
    async fn reset(&self, id: JobId, reason: &str) -> AppResult<Job>;

    /// Reclaim every processing job whose last heartbeat is older than
    /// `timeout`.
    async fn reset_stalled(&self, timeout: Duration) -> AppResult<ResetSummary>;

    /// Number of jobs in each state.
    async fn count_by_state(&self) -> AppResult<QueueStats>;
}

/// Reject job descriptors that would violate the row invariants.
pub(crate) fn validate_new_job(new: &NewJob) -> AppResult<()> {
    if new.initial_state() == JobState::Processing {
        return Err(AppError::validation(
            "jobs cannot be created in the processing state",
        ));
    }
    if let (Some(created), Some(updated)) = (new.created_at, new.updated_at) {
        if updated < created {
            return Err(AppError::validation("updated_at must not precede created_at"));
        }
    }
    Ok(())
}

pub(crate) fn validate_worker_hostname(worker_hostname: &str) -> AppResult<()> {
    if worker_hostname.trim().is_empty() {
        return Err(AppError::validation("worker hostname must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_lookup(lookup: &JobLookup) -> AppResult<()> {
    if lookup.is_empty() {
        return Err(AppError::validation(
            "job lookup requires an id or a batch spec id",
        ));
    }
    Ok(())
}

/// Error for a report or heartbeat on a row the caller does not hold.
pub(crate) fn lease_lost(id: JobId, worker_hostname: &str) -> AppError {
    AppError::lease_lost(format!(
        "job {id} is not processing for worker '{worker_hostname}'"
    ))
}

pub(crate) fn job_not_found(id: JobId) -> AppError {
    AppError::not_found(format!("job {id} not found"))
}
