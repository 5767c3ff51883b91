//! Retry, backoff and reset policies.
//!
//! Both job stores consult these to decide where a job goes after a failed
//! attempt or an expired lease. `num_failures` and `num_resets` are bounded
//! independently: reaching either bound makes the job terminal.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;

/// Failure message recorded when a job is errored for too many resets.
pub const RESETS_EXHAUSTED_MESSAGE: &str = "job exceeded maximum number of resets";

/// Shape of the backoff delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failure.
    Constant,
    /// `base * n` after the n-th failure.
    Linear,
    /// `base * 2^(n-1)` after the n-th failure.
    #[default]
    Exponential,
}

/// Decision for a job whose attempt failed with a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `queued`, not claimable before `process_after`.
    Requeue {
        /// Earliest instant the job may be claimed again.
        process_after: DateTime<Utc>,
    },
    /// Failure budget exhausted; the job becomes `errored`.
    Errored,
}

/// Decision for a processing job whose lease expired or was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Back to `queued` for another worker.
    Requeue,
    /// Reset budget exhausted; the job becomes `errored`.
    Errored,
}

/// Bounded retry with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the job is errored.
    pub max_failures: i32,
    /// Delay curve.
    pub strategy: BackoffStrategy,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the job is eligible again after its `num_failures`-th
    /// failure. Never shorter than one second and non-decreasing in
    /// `num_failures`.
    pub fn delay_for(&self, num_failures: i32) -> Duration {
        let n = num_failures.max(1) as u64;
        let base = self.base_delay.as_secs().max(1);
        let secs = match self.strategy {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let exp = u32::try_from(n - 1).unwrap_or(u32::MAX).min(63);
                base.saturating_mul(2u64.saturating_pow(exp))
            }
        };
        Duration::from_secs(secs.min(self.max_delay.as_secs().max(base)))
    }

    /// Check if `num_failures` has used up the failure budget.
    pub fn is_exhausted(&self, num_failures: i32) -> bool {
        num_failures >= self.max_failures
    }

    /// Decide what happens after a failure, given the failure count
    /// *including* this one.
    pub fn on_failure(&self, num_failures: i32, now: DateTime<Utc>) -> FailureOutcome {
        if self.is_exhausted(num_failures) {
            return FailureOutcome::Errored;
        }
        let delay = chrono::Duration::from_std(self.delay_for(num_failures))
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        FailureOutcome::Requeue {
            process_after: now + delay,
        }
    }
}

/// Bounded resets for abandoned jobs.
///
/// The reset that brings `num_resets` up to `max_resets` errors the job, so
/// a job is requeued at most `max_resets - 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPolicy {
    /// Resets allowed before the job is errored.
    pub max_resets: i32,
}

impl ResetPolicy {
    /// Decide what happens to a reclaimed job, given the reset count
    /// *including* this reset.
    pub fn on_reset(&self, num_resets: i32) -> ResetOutcome {
        if num_resets >= self.max_resets {
            ResetOutcome::Errored
        } else {
            ResetOutcome::Requeue
        }
    }
}

/// Everything a job store needs to apply queue transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    pub retry: RetryPolicy,
    pub reset: ResetPolicy,
    /// Age of the last heartbeat after which a processing job is stalled.
    pub heartbeat_timeout: Duration,
    /// Longest a single claim may run before it is abandoned without
    /// claiming anything.
    pub claim_timeout: Duration,
}

impl From<&QueueConfig> for QueuePolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_failures: config.max_failures,
                strategy: config.backoff.strategy,
                base_delay: Duration::from_secs(config.backoff.base_seconds),
                max_delay: Duration::from_secs(config.backoff.max_seconds),
            },
            reset: ResetPolicy {
                max_resets: config.max_resets,
            },
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_seconds),
            claim_timeout: Duration::from_secs(config.claim_timeout_seconds),
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}
