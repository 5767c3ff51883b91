//! Shared helpers for PostgreSQL integration tests.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};

use batchq_core::config::DatabaseConfig;
use batchq_core::policy::{BackoffStrategy, QueuePolicy, ResetPolicy, RetryPolicy};
use batchq_database::{DatabasePool, PgJobStore};

/// Environment variable naming the scratch database.
pub const DATABASE_URL_VAR: &str = "BATCHQ_TEST_DATABASE_URL";

/// Tests share one table, so they run one at a time.
static SERIAL: Mutex<()> = Mutex::const_new(());

/// Test database context
pub struct TestDb {
    pub pool: PgPool,
    pub store: PgJobStore,
    _guard: MutexGuard<'static, ()>,
}

impl TestDb {
    /// Connect, migrate and truncate. Returns `None` when no test database
    /// is configured.
    pub async fn new(policy: QueuePolicy) -> Option<Self> {
        let Ok(url) = std::env::var(DATABASE_URL_VAR) else {
            eprintln!("{DATABASE_URL_VAR} not set, skipping PostgreSQL test");
            return None;
        };

        let guard = SERIAL.lock().await;
        let mut config = DatabaseConfig::new(url);
        config.max_connections = 10;

        let db = DatabasePool::connect(&config)
            .await
            .expect("Failed to connect to test database");
        batchq_database::migration::run_migrations(db.pool())
            .await
            .expect("Failed to run migrations");

        sqlx::query("TRUNCATE batch_spec_resolution_jobs RESTART IDENTITY")
            .execute(db.pool())
            .await
            .expect("Failed to clean job table");

        let pool = db.pool().clone();
        Some(Self {
            store: PgJobStore::new(pool.clone(), policy),
            pool,
            _guard: guard,
        })
    }

    /// Age a processing job's heartbeat by `by`.
    pub async fn age_heartbeat(&self, id: i64, by: Duration) {
        sqlx::query(
            "UPDATE batch_spec_resolution_jobs \
             SET updated_at = updated_at - make_interval(secs => $2::double precision) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(by.as_secs_f64())
        .execute(&self.pool)
        .await
        .expect("Failed to age heartbeat");
    }

    /// Make a backed-off job claimable now.
    pub async fn expire_backoff(&self, id: i64) {
        sqlx::query("UPDATE batch_spec_resolution_jobs SET process_after = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .expect("Failed to expire backoff");
    }
}

/// Policy used by the integration tests: three failures, two resets.
pub fn policy() -> QueuePolicy {
    QueuePolicy {
        retry: RetryPolicy {
            max_failures: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        },
        reset: ResetPolicy { max_resets: 2 },
        heartbeat_timeout: Duration::from_secs(60),
        claim_timeout: Duration::from_secs(10),
    }
}
