//! Lookup and listing parameters, and aggregate results returned by stores.

use batchq_core::types::{BatchSpecId, JobId};
use serde::{Deserialize, Serialize};

use super::state::JobState;

/// Fetch a single job by ID, by batch spec, or by both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLookup {
    pub id: Option<JobId>,
    pub batch_spec_id: Option<BatchSpecId>,
}

impl JobLookup {
    pub fn by_id(id: JobId) -> Self {
        Self {
            id: Some(id),
            batch_spec_id: None,
        }
    }

    pub fn by_batch_spec(batch_spec_id: BatchSpecId) -> Self {
        Self {
            id: None,
            batch_spec_id: Some(batch_spec_id),
        }
    }

    /// A lookup must name at least one key.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.batch_spec_id.is_none()
    }
}

/// Optional conjunctive filters for listing jobs. Results are ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListJobsFilter {
    pub state: Option<JobState>,
    pub worker_hostname: Option<String>,
}

impl ListJobsFilter {
    /// Check whether a row with these values passes the filter.
    pub fn matches(&self, state: JobState, worker_hostname: &str) -> bool {
        self.state.is_none_or(|s| s == state)
            && self
                .worker_hostname
                .as_deref()
                .is_none_or(|w| w == worker_hostname)
    }
}

/// Result of one stalled-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    /// Jobs returned to `queued`.
    pub requeued: u64,
    /// Jobs moved to `errored` because resets were exhausted.
    pub errored: u64,
}

impl ResetSummary {
    pub fn total(&self) -> u64 {
        self.requeued + self.errored
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub errored: i64,
}

impl QueueStats {
    /// Add `count` rows in `state`.
    pub fn record(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Queued => self.queued += count,
            JobState::Processing => self.processing += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Errored => self.errored += count,
        }
    }

    /// Count for one state.
    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Queued => self.queued,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Errored => self.errored,
        }
    }

    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.completed + self.failed + self.errored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_is_conjunctive() {
        let filter = ListJobsFilter {
            state: Some(JobState::Processing),
            worker_hostname: Some("worker-a".into()),
        };
        assert!(filter.matches(JobState::Processing, "worker-a"));
        assert!(!filter.matches(JobState::Processing, "worker-b"));
        assert!(!filter.matches(JobState::Queued, "worker-a"));
        assert!(ListJobsFilter::default().matches(JobState::Errored, ""));
    }

    #[test]
    fn test_stats_record() {
        let mut stats = QueueStats::default();
        stats.record(JobState::Queued, 2);
        stats.record(JobState::Errored, 1);
        assert_eq!(stats.get(JobState::Queued), 2);
        assert_eq!(stats.total(), 3);
    }
}
