//! Job handler trait and execution errors.

use async_trait::async_trait;

use batchq_core::error::AppError;
use batchq_entity::job::{Job, JobFailure};

/// Performs the work for a claimed job.
///
/// The runner drops the returned future when the lease is lost, so
/// implementations must stop their side effects on drop.
#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Execute the job. `Ok` carries an optional detail for the execution log.
    async fn execute(&self, job: &Job) -> Result<Option<String>, JobExecutionError>;
}

/// Error from job execution
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// Permanent failure, never retried
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// Transient failure, may be retried
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

impl JobExecutionError {
    /// Convert into the failure reported to the store. Internal errors are
    /// retried only when their kind is transient.
    pub fn into_failure(self) -> JobFailure {
        match self {
            Self::Permanent(msg) => JobFailure::permanent(msg),
            Self::Transient(msg) => JobFailure::retryable(msg),
            Self::Internal(err) if err.is_transient() => JobFailure::retryable(err.to_string()),
            Self::Internal(err) => JobFailure::permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_failure() {
        assert!(JobExecutionError::Transient("flaky".into()).into_failure().retryable);
        assert!(!JobExecutionError::Permanent("bad".into()).into_failure().retryable);

        let db = JobExecutionError::from(AppError::database("connection reset"));
        assert!(db.into_failure().retryable);

        let invalid = JobExecutionError::from(AppError::validation("no such spec"));
        let failure = invalid.into_failure();
        assert!(!failure.retryable);
        assert!(failure.message.contains("no such spec"));
    }
}
