//! Job processing for batchq.
//!
//! This crate provides:
//! - [`JobQueue`], the submitter, worker and operator entry points
//! - [`WorkerRunner`], which claims jobs, heartbeats while a handler runs,
//!   and reports the outcome
//! - [`ResetMonitor`], a scheduled sweep that reclaims stalled jobs
//! - [`ExternalCommandHandler`], the default handler that resolves a batch
//!   spec by running a configured command

pub mod executor;
pub mod handlers;
pub mod monitor;
pub mod queue;
pub mod runner;

pub use executor::{JobExecutionError, JobHandler};
pub use handlers::ExternalCommandHandler;
pub use monitor::ResetMonitor;
pub use queue::JobQueue;
pub use runner::WorkerRunner;
