//! Batch spec resolution job entities.

pub mod execution_log;
pub mod filter;
pub mod model;
pub mod state;

pub use execution_log::{AttemptOutcome, ExecutionLogEntry};
pub use filter::{JobLookup, ListJobsFilter, QueueStats, ResetSummary};
pub use model::{Job, JobFailure, NewJob};
pub use state::JobState;
