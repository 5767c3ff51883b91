//! End-to-end worker flows on the in-memory store.
//!
//! Tests run with tokio's clock paused; [`TokioClock`] makes the store's
//! timestamps follow that clock so that backoff and lease ages advance with
//! the runner's timers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use batchq_core::config::{QueueConfig, WorkerConfig};
use batchq_core::policy::{BackoffStrategy, QueuePolicy};
use batchq_core::traits::Clock;
use batchq_core::types::BatchSpecId;
use batchq_database::InMemoryJobStore;
use batchq_entity::job::{AttemptOutcome, Job, JobState, ListJobsFilter, NewJob};
use batchq_worker::{JobExecutionError, JobHandler, JobQueue, WorkerRunner};

#[derive(Debug)]
struct TokioClock {
    start: DateTime<Utc>,
    base: Instant,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            base: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.base.elapsed()).unwrap();
        self.start + elapsed
    }
}

fn queue_config(max_failures: i32) -> QueueConfig {
    let mut config = QueueConfig::default();
    config.max_failures = max_failures;
    config.heartbeat_timeout_seconds = 30;
    config.backoff.strategy = BackoffStrategy::Constant;
    config.backoff.base_seconds = 2;
    config
}

fn worker_config(hostname: &str) -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        poll_interval_seconds: 1,
        heartbeat_interval_seconds: 5,
        hostname: Some(hostname.to_string()),
        ..WorkerConfig::default()
    }
}

fn queue(config: &QueueConfig) -> Arc<JobQueue> {
    let store = InMemoryJobStore::with_clock(QueuePolicy::from(config), Arc::new(TokioClock::new()));
    Arc::new(JobQueue::new(Arc::new(store), config))
}

fn spawn_runner(
    queue: &Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    hostname: &str,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let runner = WorkerRunner::new(
        Arc::clone(queue),
        handler,
        worker_config(hostname),
        hostname.to_string(),
    );
    let handle = tokio::spawn(async move { runner.run(rx).await });
    (tx, handle)
}

/// Poll until `done` holds, failing after an hour of (paused) time.
async fn wait_for<F>(queue: &JobQueue, done: F)
where
    F: Fn(&[Job]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(3600);
    loop {
        let jobs = queue.list(&ListJobsFilter::default()).await.unwrap();
        if done(&jobs) {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached: {jobs:#?}");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[derive(Debug, Default)]
struct CountingHandler {
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, job: &Job) -> Result<Option<String>, JobExecutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(12)).await;
        Ok(Some(format!("resolved batch spec {}", job.batch_spec_id)))
    }
}

#[derive(Debug)]
struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _job: &Job) -> Result<Option<String>, JobExecutionError> {
        Err(JobExecutionError::Transient("resolver unavailable".into()))
    }
}

/// Blocks until dropped, recording the drop.
#[derive(Debug, Default)]
struct HangingHandler {
    started: AtomicBool,
    dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobHandler for HangingHandler {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn execute(&self, _job: &Job) -> Result<Option<String>, JobExecutionError> {
        let _flag = DropFlag(Arc::clone(&self.dropped));
        self.started.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(None)
    }
}

#[tokio::test(start_paused = true)]
async fn test_runner_completes_all_jobs_with_heartbeats() {
    let config = queue_config(3);
    let queue = queue(&config);
    for spec in 1..=5 {
        queue.create(NewJob::new(BatchSpecId(spec))).await.unwrap();
    }

    let handler = Arc::new(CountingHandler::default());
    let (stop, handle) = spawn_runner(&queue, handler.clone(), "worker-a");

    wait_for(&queue, |jobs| jobs.iter().all(|j| j.state == JobState::Completed)).await;
    stop.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(handler.runs.load(Ordering::SeqCst), 5);
    for job in queue.list(&ListJobsFilter::default()).await.unwrap() {
        assert_eq!(job.execution_logs.len(), 1);
        let entry = &job.execution_logs[0];
        assert_eq!(entry.outcome, AttemptOutcome::Success);
        assert_eq!(entry.worker_hostname, "worker-a");
        // Handlers outlive several heartbeat intervals without being reclaimed.
        assert!(entry.duration_ms() >= 12_000);
        assert_eq!(job.num_resets, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_retries() {
    let config = queue_config(3);
    let queue = queue(&config);
    let job = queue.create(NewJob::new(BatchSpecId(9))).await.unwrap();

    let (stop, handle) = spawn_runner(&queue, Arc::new(FailingHandler), "worker-a");
    wait_for(&queue, |jobs| jobs[0].state == JobState::Errored).await;
    stop.send(true).unwrap();
    handle.await.unwrap();

    let row = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.num_failures, 3);
    assert_eq!(row.failure_message.as_deref(), Some("resolver unavailable"));
    assert_eq!(row.execution_logs.len(), 3);
    assert!(
        row.execution_logs
            .iter()
            .all(|e| e.outcome == AttemptOutcome::Failure)
    );

    // Each retry waited out its backoff.
    for pair in row.execution_logs.windows(2) {
        assert!(pair[1].started_at - pair[0].finished_at >= chrono::Duration::seconds(2));
    }
}

#[tokio::test(start_paused = true)]
async fn test_lease_loss_cancels_handler() {
    let config = queue_config(3);
    let queue = queue(&config);
    let job = queue.create(NewJob::new(BatchSpecId(4))).await.unwrap();

    let handler = Arc::new(HangingHandler::default());
    let (stop, handle) = spawn_runner(&queue, handler.clone(), "worker-a");

    wait_for(&queue, |jobs| jobs[0].state == JobState::Processing).await;
    assert!(handler.started.load(Ordering::SeqCst));

    // Stop claiming so the reset job stays queued.
    stop.send(true).unwrap();
    queue.reset(job.id).await.unwrap();

    handle.await.unwrap();
    assert!(handler.dropped.load(Ordering::SeqCst));

    let row = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Queued);
    assert_eq!(row.num_resets, 1);
    assert_eq!(row.execution_logs.len(), 1);
    assert_eq!(row.execution_logs[0].outcome, AttemptOutcome::Reset);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_worker_job_is_reclaimed_and_finished() {
    let config = queue_config(3);
    let queue = queue(&config);
    let job = queue.create(NewJob::new(BatchSpecId(1))).await.unwrap();

    // A worker claims the job and then disappears without heartbeating.
    queue.claim("crashed-worker").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;

    let summary = queue.reset_stalled().await.unwrap();
    assert_eq!(summary.requeued, 1);

    let (stop, handle) = spawn_runner(&queue, Arc::new(CountingHandler::default()), "worker-b");
    wait_for(&queue, |jobs| jobs[0].state == JobState::Completed).await;
    stop.send(true).unwrap();
    handle.await.unwrap();

    let row = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.num_resets, 1);
    let outcomes: Vec<AttemptOutcome> = row.execution_logs.iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Reset, AttemptOutcome::Success]);
    assert_eq!(row.execution_logs[0].worker_hostname, "crashed-worker");
    assert_eq!(row.execution_logs[1].worker_hostname, "worker-b");
}
