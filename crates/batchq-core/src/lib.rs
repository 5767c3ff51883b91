//! # batchq-core
//!
//! Core crate for batchq, the PostgreSQL-backed batch spec resolution
//! queue. Contains configuration schemas, the retry and reset policies,
//! typed identifiers, the clock abstraction, and the unified error system.
//!
//! This crate has **no** internal dependencies on other batchq crates.

pub mod config;
pub mod error;
pub mod policy;
pub mod result;
pub mod traits;
pub mod types;

pub use error::AppError;
pub use result::AppResult;
