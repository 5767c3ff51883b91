//! # batchq-entity
//!
//! Domain entity models for batchq. [`job::Job`] mirrors one row of the
//! `batch_spec_resolution_jobs` table; the remaining types are the values
//! that flow into and out of the job stores.

pub mod job;

pub use job::{
    AttemptOutcome, ExecutionLogEntry, Job, JobFailure, JobLookup, JobState, ListJobsFilter,
    NewJob, QueueStats, ResetSummary,
};
