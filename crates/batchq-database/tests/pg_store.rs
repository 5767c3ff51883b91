//! Integration tests for the PostgreSQL job store.
//!
//! Run with `BATCHQ_TEST_DATABASE_URL` pointing at a scratch database.

mod helpers;

use std::collections::HashSet;
use std::time::Duration;

use batchq_core::error::ErrorKind;
use batchq_core::policy::RESETS_EXHAUSTED_MESSAGE;
use batchq_core::types::{BatchSpecId, JobId};
use batchq_database::JobStore;
use batchq_entity::job::{AttemptOutcome, JobFailure, JobLookup, JobState, ListJobsFilter, NewJob};

use helpers::TestDb;

#[tokio::test]
async fn test_create_and_lookup() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let job = db
        .store
        .create(&NewJob::new(BatchSpecId(42)).allow_unsupported(true))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert!(job.allow_unsupported);
    assert!(!job.allow_ignored);
    assert!(job.execution_logs.is_empty());
    assert_eq!(job.created_at, job.updated_at);

    let by_spec = db
        .store
        .get(JobLookup::by_batch_spec(BatchSpecId(42)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_spec.id, job.id);
    assert!(db.store.get_by_id(JobId(job.id.get() + 100)).await.unwrap().is_none());

    let err = db.store.get(JobLookup::default()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn test_create_terminal_job_is_never_claimed() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let job = db
        .store
        .create(&NewJob::new(BatchSpecId(1)).with_state(JobState::Errored))
        .await
        .unwrap();
    assert!(job.finished_at.is_some());
    assert!(db.store.dequeue("worker-a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_dequeue_never_double_claims() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let batch: Vec<NewJob> = (0..20).map(|i| NewJob::new(BatchSpecId(i))).collect();
    db.store.create_many(&batch).await.unwrap();

    let claims = (0..40).map(|i| {
        let store = db.store.clone();
        tokio::spawn(async move { store.dequeue(&format!("worker-{i}")).await })
    });
    let claimed: Vec<_> = futures::future::join_all(claims)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap().unwrap())
        .collect();

    let ids: HashSet<JobId> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(claimed.len(), 20);
    assert_eq!(ids.len(), 20);
    assert!(claimed.iter().all(|j| j.state == JobState::Processing));
}

#[tokio::test]
async fn test_failure_backoff_then_errored() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let job = db.store.create(&NewJob::new(BatchSpecId(7))).await.unwrap();

    for attempt in 1..=3 {
        let claimed = db.store.dequeue("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);

        let row = db
            .store
            .mark_failed(job.id, "worker-a", &JobFailure::retryable(format!("attempt {attempt}")))
            .await
            .unwrap();
        assert_eq!(row.num_failures, attempt);
        assert_eq!(row.execution_logs.len(), attempt as usize);
        assert_eq!(row.execution_logs.last().map(|e| e.outcome), Some(AttemptOutcome::Failure));

        if attempt < 3 {
            assert_eq!(row.state, JobState::Queued);
            assert!(row.process_after.is_some_and(|after| after > row.updated_at));
            assert!(row.worker_hostname.is_empty());
            assert!(db.store.dequeue("worker-a").await.unwrap().is_none());
            db.expire_backoff(job.id.get()).await;
        } else {
            assert_eq!(row.state, JobState::Errored);
            assert!(row.finished_at.is_some());
        }
    }

    assert!(db.store.dequeue("worker-a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reports_require_the_lease() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let job = db.store.create(&NewJob::new(BatchSpecId(3))).await.unwrap();
    db.store.dequeue("worker-a").await.unwrap().unwrap();

    let err = db.store.heartbeat(job.id, "worker-b").await.unwrap_err();
    assert!(err.is_lease_lost());
    let err = db
        .store
        .mark_failed(job.id, "worker-b", &JobFailure::permanent("nope"))
        .await
        .unwrap_err();
    assert!(err.is_lease_lost());

    db.store.heartbeat(job.id, "worker-a").await.unwrap();
    let done = db
        .store
        .mark_completed(job.id, "worker-a", Some("ok"))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.execution_logs.len(), 1);
    assert_eq!(done.execution_logs[0].worker_hostname, "worker-a");
    assert_eq!(done.execution_logs[0].detail.as_deref(), Some("ok"));

    let err = db.store.mark_completed(job.id, "worker-a", None).await.unwrap_err();
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn test_reset_stalled_requeues_then_errors() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };
    let timeout = Duration::from_secs(60);

    let job = db.store.create(&NewJob::new(BatchSpecId(5))).await.unwrap();
    db.store.dequeue("worker-a").await.unwrap().unwrap();

    assert_eq!(db.store.reset_stalled(timeout).await.unwrap().total(), 0);

    db.age_heartbeat(job.id.get(), Duration::from_secs(120)).await;
    let summary = db.store.reset_stalled(timeout).await.unwrap();
    assert_eq!((summary.requeued, summary.errored), (1, 0));

    let row = db.store.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Queued);
    assert_eq!(row.num_resets, 1);
    assert!(row.worker_hostname.is_empty());
    assert_eq!(row.execution_logs[0].outcome, AttemptOutcome::Reset);
    assert_eq!(row.execution_logs[0].worker_hostname, "worker-a");

    db.store.dequeue("worker-b").await.unwrap().unwrap();
    db.age_heartbeat(job.id.get(), Duration::from_secs(120)).await;
    let summary = db.store.reset_stalled(timeout).await.unwrap();
    assert_eq!((summary.requeued, summary.errored), (0, 1));

    let row = db.store.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Errored);
    assert_eq!(row.failure_message.as_deref(), Some(RESETS_EXHAUSTED_MESSAGE));
    assert_eq!(row.execution_logs.len(), 2);
}

#[tokio::test]
async fn test_list_and_stats() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    for spec in 0..4 {
        db.store.create(&NewJob::new(BatchSpecId(spec))).await.unwrap();
    }
    let first = db.store.dequeue("worker-a").await.unwrap().unwrap();
    db.store.dequeue("worker-b").await.unwrap().unwrap();
    db.store.mark_completed(first.id, "worker-a", None).await.unwrap();

    let queued = db
        .store
        .list(&ListJobsFilter {
            state: Some(JobState::Queued),
            worker_hostname: None,
        })
        .await
        .unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.windows(2).all(|w| w[0].id < w[1].id));

    let mine = db
        .store
        .list(&ListJobsFilter {
            state: Some(JobState::Processing),
            worker_hostname: Some("worker-b".into()),
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);

    let stats = db.store.count_by_state().await.unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_operator_reset() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let job = db.store.create(&NewJob::new(BatchSpecId(8))).await.unwrap();
    let err = db.store.reset(job.id, "operator").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    db.store.dequeue("worker-a").await.unwrap().unwrap();
    let row = db.store.reset(job.id, "operator").await.unwrap();
    assert_eq!(row.state, JobState::Queued);
    assert_eq!(row.num_resets, 1);
    assert_eq!(row.execution_logs[0].detail.as_deref(), Some("operator"));
}

#[tokio::test]
async fn test_success_after_retry_clears_failure_message() {
    let Some(db) = TestDb::new(helpers::policy()).await else {
        return;
    };

    let job = db.store.create(&NewJob::new(BatchSpecId(11))).await.unwrap();
    db.store.dequeue("worker-a").await.unwrap().unwrap();
    let failed = db
        .store
        .mark_failed(job.id, "worker-a", &JobFailure::retryable("boom"))
        .await
        .unwrap();
    assert_eq!(failed.failure_message.as_deref(), Some("boom"));
    db.expire_backoff(job.id.get()).await;

    db.store.dequeue("worker-b").await.unwrap().unwrap();
    let done = db.store.mark_completed(job.id, "worker-b", None).await.unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.failure_message, None);
    assert_eq!(done.execution_logs.len(), 2);
}

#[tokio::test]
async fn test_claim_past_deadline_rolls_back() {
    let mut policy = helpers::policy();
    policy.claim_timeout = Duration::from_millis(500);
    let Some(db) = TestDb::new(policy).await else {
        return;
    };

    let job = db.store.create(&NewJob::new(BatchSpecId(12))).await.unwrap();

    // Hold the table so the claim has to wait past its deadline.
    let mut blocker = db.pool.begin().await.unwrap();
    sqlx::query("LOCK TABLE batch_spec_resolution_jobs IN ACCESS EXCLUSIVE MODE")
        .execute(&mut *blocker)
        .await
        .unwrap();

    let err = db.store.dequeue("worker-a").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(err.is_transient());
    blocker.rollback().await.unwrap();

    let row = db.store.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Queued);
    assert!(row.worker_hostname.is_empty());
    assert_eq!(row.started_at, None);

    let claimed = db.store.dequeue("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
}
