//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so that concurrent workers never
//! block on, or double-claim, the same row. All timestamps come from the
//! database clock (`NOW()`), so workers with skewed clocks agree on lease
//! ages and backoff deadlines.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use batchq_core::error::{AppError, ErrorKind};
use batchq_core::policy::{QueuePolicy, RESETS_EXHAUSTED_MESSAGE};
use batchq_core::result::AppResult;
use batchq_core::types::JobId;
use batchq_entity::job::{
    Job, JobFailure, JobLookup, JobState, ListJobsFilter, NewJob, QueueStats, ResetSummary,
};

use crate::store::{
    JobStore, job_not_found, lease_lost, validate_lookup, validate_new_job,
    validate_worker_hostname,
};

/// SET clause shared by the stalled sweep and the operator reset. Expects
/// the target row aliased as `j`, `$2` = max resets, `$3` = exhausted
/// message, `$4` = log detail.
const RESET_ASSIGNMENTS: &str = "\
    num_resets = j.num_resets + 1, \
    state = CASE WHEN j.num_resets + 1 >= $2 \
        THEN 'errored'::batch_spec_resolution_job_state \
        ELSE 'queued'::batch_spec_resolution_job_state END, \
    failure_message = CASE WHEN j.num_resets + 1 >= $2 THEN $3 ELSE j.failure_message END, \
    finished_at = CASE WHEN j.num_resets + 1 >= $2 THEN NOW() ELSE NULL END, \
    worker_hostname = CASE WHEN j.num_resets + 1 >= $2 THEN j.worker_hostname ELSE '' END, \
    updated_at = NOW(), \
    execution_logs = j.execution_logs || jsonb_build_array(jsonb_build_object( \
        'attempt', jsonb_array_length(j.execution_logs) + 1, \
        'worker_hostname', j.worker_hostname, \
        'started_at', j.started_at, \
        'finished_at', NOW(), \
        'outcome', 'reset', \
        'detail', $4::text))";

/// Detail recorded on entries written by the stalled sweep.
const STALLED_DETAIL: &str = "lease expired without heartbeat";

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";

/// Map a claim error, reporting a cancelled statement as a timeout.
fn claim_error(err: sqlx::Error) -> AppError {
    let cancelled = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code.as_ref() == QUERY_CANCELED);
    if cancelled {
        AppError::with_source(ErrorKind::Timeout, "Claim exceeded its deadline", err)
    } else {
        AppError::with_source(ErrorKind::Database, "Failed to dequeue job", err)
    }
}

/// Job store backed by the `batch_spec_resolution_jobs` table.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    policy: QueuePolicy,
}

impl PgJobStore {
    /// Create a new store applying `policy` to failures and resets.
    pub fn new(pool: PgPool, policy: QueuePolicy) -> Self {
        Self { pool, policy }
    }

    /// The policy applied by this store.
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Distinguish a missing row from a row the caller no longer holds.
    async fn not_held(&self, id: JobId, worker_hostname: &str) -> AppError {
        match self.exists(id).await {
            Ok(true) => lease_lost(id, worker_hostname),
            Ok(false) => job_not_found(id),
            Err(e) => e,
        }
    }

    async fn exists(&self, id: JobId) -> AppResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM batch_spec_resolution_jobs WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to check job", e))
    }

    async fn insert<'e, E>(executor: E, new: &NewJob) -> AppResult<Job>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let state = new.initial_state();
        sqlx::query_as::<_, Job>(
            "INSERT INTO batch_spec_resolution_jobs \
                (batch_spec_id, allow_unsupported, allow_ignored, state, created_at, updated_at, finished_at) \
             VALUES ($1, $2, $3, $4, \
                COALESCE($5::timestamptz, NOW()), \
                COALESCE($6::timestamptz, $5::timestamptz, NOW()), \
                CASE WHEN $7 THEN COALESCE($6::timestamptz, $5::timestamptz, NOW()) END) \
             RETURNING *",
        )
        .bind(new.batch_spec_id)
        .bind(new.allow_unsupported)
        .bind(new.allow_ignored)
        .bind(state)
        .bind(new.created_at)
        .bind(new.updated_at)
        .bind(state.is_terminal())
        .fetch_one(executor)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create job", e))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new: &NewJob) -> AppResult<Job> {
        validate_new_job(new)?;
        let job = Self::insert(&self.pool, new).await?;
        info!(job_id = %job.id, batch_spec_id = %job.batch_spec_id, state = %job.state, "Job created");
        Ok(job)
    }

    async fn create_many(&self, new: &[NewJob]) -> AppResult<Vec<Job>> {
        for item in new {
            validate_new_job(item)?;
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin transaction", e)
        })?;

        let mut jobs = Vec::with_capacity(new.len());
        for item in new {
            jobs.push(Self::insert(&mut *tx, item).await?);
        }

        tx.commit().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to commit job batch", e)
        })?;

        info!(count = jobs.len(), "Jobs created");
        Ok(jobs)
    }

    async fn get(&self, lookup: JobLookup) -> AppResult<Option<Job>> {
        validate_lookup(&lookup)?;
        sqlx::query_as::<_, Job>(
            "SELECT * FROM batch_spec_resolution_jobs \
             WHERE ($1::bigint IS NULL OR id = $1) \
               AND ($2::bigint IS NULL OR batch_spec_id = $2) \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(lookup.id)
        .bind(lookup.batch_spec_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find job", e))
    }

    async fn list(&self, filter: &ListJobsFilter) -> AppResult<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            "SELECT * FROM batch_spec_resolution_jobs \
             WHERE ($1::batch_spec_resolution_job_state IS NULL OR state = $1) \
               AND ($2::text IS NULL OR worker_hostname = $2) \
             ORDER BY id ASC",
        )
        .bind(filter.state)
        .bind(filter.worker_hostname.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to list jobs", e))
    }

    async fn dequeue(&self, worker_hostname: &str) -> AppResult<Option<Job>> {
        validate_worker_hostname(worker_hostname)?;

        // The deadline is enforced by the server: a cancelled claim aborts
        // its transaction, so it can never commit after the caller gave up.
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin transaction", e)
        })?;
        let timeout_ms = self.policy.claim_timeout.as_millis().clamp(1, i32::MAX as u128);
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to set claim deadline", e)
            })?;

        let job = sqlx::query_as::<_, Job>(
            "UPDATE batch_spec_resolution_jobs \
             SET state = 'processing', started_at = NOW(), updated_at = NOW(), worker_hostname = $1 \
             WHERE id = ( \
                SELECT id FROM batch_spec_resolution_jobs \
                WHERE state = 'queued' \
                  AND (process_after IS NULL OR process_after <= NOW()) \
                ORDER BY created_at ASC, id ASC \
                FOR UPDATE SKIP LOCKED \
                LIMIT 1 \
             ) RETURNING *",
        )
        .bind(worker_hostname)
        .fetch_optional(&mut *tx)
        .await
        .map_err(claim_error)?;

        tx.commit().await.map_err(claim_error)?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, worker = worker_hostname, "Job claimed");
        }
        Ok(job)
    }

    async fn heartbeat(&self, id: JobId, worker_hostname: &str) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE batch_spec_resolution_jobs SET updated_at = NOW() \
             WHERE id = $1 AND state = 'processing' AND worker_hostname = $2",
        )
        .bind(id)
        .bind(worker_hostname)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to record heartbeat", e))?;

        if result.rows_affected() == 0 {
            return Err(self.not_held(id, worker_hostname).await);
        }
        debug!(job_id = %id, worker = worker_hostname, "Heartbeat recorded");
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: JobId,
        worker_hostname: &str,
        detail: Option<&str>,
    ) -> AppResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            "UPDATE batch_spec_resolution_jobs SET \
                state = 'completed', failure_message = NULL, finished_at = NOW(), updated_at = NOW(), \
                execution_logs = execution_logs || jsonb_build_array(jsonb_build_object( \
                    'attempt', jsonb_array_length(execution_logs) + 1, \
                    'worker_hostname', worker_hostname, \
                    'started_at', started_at, \
                    'finished_at', NOW(), \
                    'outcome', 'success', \
                    'detail', $3::text)) \
             WHERE id = $1 AND state = 'processing' AND worker_hostname = $2 \
             RETURNING *",
        )
        .bind(id)
        .bind(worker_hostname)
        .bind(detail)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to complete job", e))?;

        match job {
            Some(job) => {
                info!(job_id = %id, worker = worker_hostname, "Job completed");
                Ok(job)
            }
            None => Err(self.not_held(id, worker_hostname).await),
        }
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_hostname: &str,
        failure: &JobFailure,
    ) -> AppResult<Job> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to begin transaction", e)
        })?;

        let current = sqlx::query_as::<_, Job>(
            "SELECT * FROM batch_spec_resolution_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to lock job", e))?
        .ok_or_else(|| job_not_found(id))?;

        if !current.is_held_by(worker_hostname) {
            return Err(lease_lost(id, worker_hostname));
        }

        let num_failures = current.num_failures + 1;
        let (state, delay) = if !failure.retryable {
            (JobState::Failed, None)
        } else if self.policy.retry.is_exhausted(num_failures) {
            (JobState::Errored, None)
        } else {
            let delay = self.policy.retry.delay_for(num_failures);
            (JobState::Queued, Some(delay.as_secs_f64()))
        };

        let job = sqlx::query_as::<_, Job>(
            "UPDATE batch_spec_resolution_jobs SET \
                state = $2, \
                num_failures = $3, \
                failure_message = $4, \
                process_after = NOW() + make_interval(secs => $5::double precision), \
                finished_at = CASE WHEN $2 = 'queued'::batch_spec_resolution_job_state THEN NULL ELSE NOW() END, \
                worker_hostname = CASE WHEN $2 = 'queued'::batch_spec_resolution_job_state THEN '' ELSE worker_hostname END, \
                updated_at = NOW(), \
                execution_logs = execution_logs || jsonb_build_array(jsonb_build_object( \
                    'attempt', jsonb_array_length(execution_logs) + 1, \
                    'worker_hostname', worker_hostname, \
                    'started_at', started_at, \
                    'finished_at', NOW(), \
                    'outcome', 'failure', \
                    'detail', $4::text)) \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(id)
        .bind(state)
        .bind(num_failures)
        .bind(&failure.message)
        .bind(delay)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to record job failure", e))?;

        tx.commit().await.map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to commit job failure", e)
        })?;

        warn!(
            job_id = %id,
            worker = worker_hostname,
            num_failures,
            state = %job.state,
            error = %failure.message,
            "Job attempt failed"
        );
        Ok(job)
    }

    async fn reset(&self, id: JobId, reason: &str) -> AppResult<Job> {
        let sql = format!(
            "UPDATE batch_spec_resolution_jobs j SET {RESET_ASSIGNMENTS} \
             WHERE j.id = $1 AND j.state = 'processing' \
             RETURNING j.*"
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(self.policy.reset.max_resets)
            .bind(RESETS_EXHAUSTED_MESSAGE)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to reset job", e))?;

        let Some(job) = job else {
            return if self.exists(id).await? {
                Err(AppError::conflict(format!("job {id} is not processing")))
            } else {
                Err(job_not_found(id))
            };
        };

        warn!(job_id = %id, state = %job.state, num_resets = job.num_resets, reason, "Job reset");
        Ok(job)
    }

    async fn reset_stalled(&self, timeout: Duration) -> AppResult<ResetSummary> {
        let sql = format!(
            "WITH stalled AS ( \
                SELECT id FROM batch_spec_resolution_jobs \
                WHERE state = 'processing' \
                  AND updated_at < NOW() - make_interval(secs => $1::double precision) \
                FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE batch_spec_resolution_jobs j SET {RESET_ASSIGNMENTS} \
             FROM stalled WHERE j.id = stalled.id \
             RETURNING j.id, j.state"
        );

        let rows: Vec<(JobId, JobState)> = sqlx::query_as(&sql)
            .bind(timeout.as_secs_f64())
            .bind(self.policy.reset.max_resets)
            .bind(RESETS_EXHAUSTED_MESSAGE)
            .bind(STALLED_DETAIL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to reset stalled jobs", e)
            })?;

        let mut summary = ResetSummary::default();
        for (id, state) in rows {
            if state == JobState::Errored {
                summary.errored += 1;
            } else {
                summary.requeued += 1;
            }
            warn!(job_id = %id, state = %state, "Stalled job reclaimed");
        }
        Ok(summary)
    }

    async fn count_by_state(&self) -> AppResult<QueueStats> {
        let rows: Vec<(JobState, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM batch_spec_resolution_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to count jobs", e))?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.record(state, count);
        }
        Ok(stats)
    }
}
