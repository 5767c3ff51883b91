//! Scheduled sweep that reclaims jobs whose workers stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing;

use batchq_core::error::AppError;

use crate::queue::JobQueue;

/// Periodic stalled-job reclaimer.
///
/// Many monitors may run against one database at once; the sweep locks rows
/// with `SKIP LOCKED`, so each stalled job is reclaimed by one of them.
pub struct ResetMonitor {
    /// The underlying job scheduler
    scheduler: JobScheduler,
    /// Queue the sweep runs against
    queue: Arc<JobQueue>,
    /// Time between sweeps
    interval: Duration,
}

impl std::fmt::Debug for ResetMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetMonitor")
            .field("interval", &self.interval)
            .finish()
    }
}

impl ResetMonitor {
    /// Create a monitor sweeping every `interval`
    pub async fn new(queue: Arc<JobQueue>, interval: Duration) -> Result<Self, AppError> {
        if interval.is_zero() {
            return Err(AppError::configuration(
                "reset interval must be at least one second",
            ));
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::internal(format!("Failed to create scheduler: {}", e)))?;

        let monitor = Self {
            scheduler,
            queue,
            interval,
        };
        monitor.register_sweep().await?;
        Ok(monitor)
    }

    /// Start sweeping
    pub async fn start(&self) -> Result<(), AppError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::internal(format!("Failed to start scheduler: {}", e)))?;

        tracing::info!(
            "Reset monitor started (every {}s, heartbeat timeout {}s)",
            self.interval.as_secs(),
            self.queue.policy().heartbeat_timeout.as_secs()
        );
        Ok(())
    }

    /// Stop sweeping
    pub async fn shutdown(&self) -> Result<(), AppError> {
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Failed to shutdown scheduler: {}", e)))?;

        tracing::info!("Reset monitor shut down");
        Ok(())
    }

    async fn register_sweep(&self) -> Result<(), AppError> {
        let queue = Arc::clone(&self.queue);
        let job = CronJob::new_repeated_async(self.interval, move |_uuid, _lock| {
            let queue = Arc::clone(&queue);
            Box::pin(async move {
                tracing::trace!("Running stalled job sweep");
                if let Err(e) = queue.reset_stalled().await {
                    tracing::error!("Stalled job sweep failed: {}", e);
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create reset schedule: {}", e)))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::internal(format!("Failed to add reset schedule: {}", e)))?;

        tracing::info!("Registered: stalled job sweep (every {}s)", self.interval.as_secs());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchq_core::config::QueueConfig;
    use batchq_database::InMemoryJobStore;

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let config = QueueConfig::default();
        let queue = Arc::new(JobQueue::new(Arc::new(InMemoryJobStore::default()), &config));
        let err = ResetMonitor::new(queue, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind, batchq_core::error::ErrorKind::Configuration);
    }
}
