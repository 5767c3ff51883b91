//! Worker runner: the main loop that claims jobs and executes them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::time;
use tracing;

use batchq_core::config::WorkerConfig;
use batchq_entity::job::Job;

use crate::executor::{JobExecutionError, JobHandler};
use crate::queue::JobQueue;

/// Longest time shutdown waits for in-flight jobs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Pick the identity this worker claims jobs under.
///
/// Uses the configured hostname when set, otherwise `$HOSTNAME` (or
/// `batchq`) with a random suffix so that two processes on one host never
/// share an identity.
pub fn resolve_hostname(config: &WorkerConfig) -> String {
    if let Some(hostname) = &config.hostname {
        return hostname.clone();
    }
    let base = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "batchq".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{base}-{}", &suffix[..8])
}

/// How a job's execution ended from the runner's point of view
enum Execution {
    Finished(Result<Option<String>, JobExecutionError>),
    LeaseLost,
}

/// Main worker runner that polls the queue and executes jobs
#[derive(Debug)]
pub struct WorkerRunner {
    /// Job queue for claiming and reporting
    queue: Arc<JobQueue>,
    /// Handler that performs the work
    handler: Arc<dyn JobHandler>,
    /// Worker configuration
    config: WorkerConfig,
    /// Identity written to `worker_hostname`
    hostname: String,
}

impl WorkerRunner {
    /// Create a new worker runner
    pub fn new(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
        hostname: String,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            hostname,
        }
    }

    /// Identity this runner claims jobs under
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Start the worker runner; runs until the cancel signal is received
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        tracing::info!(
            "Worker '{}' started with handler='{}', concurrency={}, poll_interval={}s, heartbeat_interval={}s",
            self.hostname,
            self.handler.name(),
            self.config.concurrency,
            self.config.poll_interval_seconds,
            self.config.heartbeat_interval_seconds
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);

        loop {
            if *cancel.borrow() {
                tracing::info!("Worker '{}' received shutdown signal", self.hostname);
                break;
            }

            // Claims are not raced against shutdown: a committed claim must
            // reach a handler.
            if self.poll_and_execute(&semaphore).await {
                continue;
            }

            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() {
                        tracing::info!("Worker '{}' lost its shutdown channel", self.hostname);
                        break;
                    }
                }
                _ = time::sleep(poll_interval) => {}
            }
        }

        tracing::info!(
            "Worker '{}' waiting for in-flight jobs to complete...",
            self.hostname
        );

        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        if time::timeout(SHUTDOWN_GRACE, semaphore.acquire_many(permits))
            .await
            .is_err()
        {
            tracing::warn!(
                "Worker '{}' stopped with jobs still running; their leases will expire",
                self.hostname
            );
        }

        tracing::info!("Worker '{}' shut down complete", self.hostname);
    }

    /// Claim a job and spawn its execution. Returns whether a job was claimed.
    async fn poll_and_execute(&self, semaphore: &Arc<Semaphore>) -> bool {
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            tracing::trace!("All worker slots occupied, waiting...");
            return false;
        };

        match self.queue.claim(&self.hostname).await {
            Ok(Some(job)) => {
                let queue = Arc::clone(&self.queue);
                let handler = Arc::clone(&self.handler);
                let hostname = self.hostname.clone();
                let heartbeat_interval =
                    Duration::from_secs(self.config.heartbeat_interval_seconds);

                tokio::spawn(async move {
                    let _permit = permit;
                    process_job(&queue, handler.as_ref(), &job, &hostname, heartbeat_interval)
                        .await;
                });
                true
            }
            Ok(None) => {
                tracing::trace!("No jobs available");
                false
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Transient error while claiming job: {}", e);
                false
            }
            Err(e) => {
                tracing::error!("Failed to claim job: {}", e);
                false
            }
        }
    }
}

/// Run the handler while heartbeating, then report the outcome
async fn process_job(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: &Job,
    hostname: &str,
    heartbeat_interval: Duration,
) {
    tracing::info!(
        "Processing job: id={}, batch_spec_id={}, attempt={}",
        job.id,
        job.batch_spec_id,
        job.next_attempt()
    );

    match execute_with_heartbeat(queue, handler, job, hostname, heartbeat_interval).await {
        Execution::LeaseLost => {
            tracing::warn!(
                "Lost lease on job {}; abandoned execution without reporting",
                job.id
            );
        }
        Execution::Finished(Ok(detail)) => {
            match queue.report_success(job.id, hostname, detail.as_deref()).await {
                Ok(_) => tracing::info!("Job {} completed successfully", job.id),
                Err(e) if e.is_lease_lost() => {
                    tracing::warn!("Job {} finished after its lease was lost: {}", job.id, e)
                }
                Err(e) => tracing::error!("Failed to mark job {} as completed: {}", job.id, e),
            }
        }
        Execution::Finished(Err(err)) => {
            let failure = err.into_failure();
            if failure.retryable {
                tracing::warn!("Job {} failed (transient): {}", job.id, failure.message);
            } else {
                tracing::error!("Job {} failed permanently: {}", job.id, failure.message);
            }

            match queue.report_failure(job.id, hostname, &failure).await {
                Ok(row) => tracing::debug!("Job {} is now {}", row.id, row.state),
                Err(e) if e.is_lease_lost() => {
                    tracing::warn!("Job {} failed after its lease was lost: {}", job.id, e)
                }
                Err(e) => tracing::error!("Failed to record failure of job {}: {}", job.id, e),
            }
        }
    }
}

/// Drive the handler, sending a heartbeat every `interval`. The handler
/// future is dropped as soon as a heartbeat reports the lease lost.
async fn execute_with_heartbeat(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: &Job,
    hostname: &str,
    interval: Duration,
) -> Execution {
    let execution = handler.execute(job);
    tokio::pin!(execution);

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The claim itself refreshed the lease.
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut execution => return Execution::Finished(result),
            _ = ticker.tick() => {
                match queue.heartbeat(job.id, hostname).await {
                    Ok(()) => {}
                    Err(e) if e.is_lease_lost() => return Execution::LeaseLost,
                    Err(e) => tracing::warn!("Heartbeat for job {} failed: {}", job.id, e),
                }
            }
        }
    }
}
