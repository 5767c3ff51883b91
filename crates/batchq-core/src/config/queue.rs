//! Queue configuration: retry/reset bounds, lease timeout and backoff.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::policy::BackoffStrategy;

/// Queue-wide policy knobs shared by every worker and monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of resets (lease expiries) after which a job is errored.
    ///
    /// The reset that reaches this count errors the job instead of
    /// requeueing it, so a job is handed to a new worker at most
    /// `max_resets - 1` times.
    #[serde(default = "default_max_resets")]
    pub max_resets: i32,
    /// Number of failed attempts after which a job is errored.
    #[serde(default = "default_max_failures")]
    pub max_failures: i32,
    /// A processing job without a heartbeat for this long is reclaimed.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    /// Interval in seconds between stalled-job sweeps.
    #[serde(default = "default_reset_interval")]
    pub reset_interval_seconds: u64,
    /// Upper bound in seconds for a single claim attempt. An expired claim
    /// is rolled back and leaves the job queued.
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,
    /// Delay applied before a failed job becomes claimable again.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Backoff function configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Shape of the delay curve.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Delay for the first failure, in seconds.
    #[serde(default = "default_base")]
    pub base_seconds: u64,
    /// Cap on the delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_resets: default_max_resets(),
            max_failures: default_max_failures(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            reset_interval_seconds: default_reset_interval(),
            claim_timeout_seconds: default_claim_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_seconds: default_base(),
            max_seconds: default_max_delay(),
        }
    }
}

impl QueueConfig {
    pub(crate) fn validate(&self) -> Result<(), AppError> {
        if self.max_resets < 1 {
            return Err(AppError::configuration("queue.max_resets must be at least 1"));
        }
        if self.max_failures < 1 {
            return Err(AppError::configuration(
                "queue.max_failures must be at least 1",
            ));
        }
        if self.heartbeat_timeout_seconds == 0 {
            return Err(AppError::configuration(
                "queue.heartbeat_timeout_seconds must be at least 1",
            ));
        }
        if self.reset_interval_seconds == 0 || self.claim_timeout_seconds == 0 {
            return Err(AppError::configuration(
                "queue.reset_interval_seconds and queue.claim_timeout_seconds must be at least 1",
            ));
        }
        if self.backoff.base_seconds == 0 {
            return Err(AppError::configuration(
                "queue.backoff.base_seconds must be at least 1",
            ));
        }
        if self.backoff.max_seconds < self.backoff.base_seconds {
            return Err(AppError::configuration(
                "queue.backoff.max_seconds must not be smaller than base_seconds",
            ));
        }
        Ok(())
    }
}

fn default_max_resets() -> i32 {
    3
}

fn default_max_failures() -> i32 {
    3
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_reset_interval() -> u64 {
    30
}

fn default_claim_timeout() -> u64 {
    10
}

fn default_base() -> u64 {
    10
}

fn default_max_delay() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bounds_rejected() {
        let cfg = QueueConfig {
            max_failures: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = QueueConfig {
            max_resets: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_below_base_rejected() {
        let cfg = QueueConfig {
            backoff: BackoffConfig {
                strategy: BackoffStrategy::Exponential,
                base_seconds: 30,
                max_seconds: 10,
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
