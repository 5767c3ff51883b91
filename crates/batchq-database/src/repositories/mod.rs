//! PostgreSQL-backed repositories.

pub mod job;

pub use job::PgJobStore;
