//! Convenience result type alias for batchq.

use crate::error::AppError;

/// A specialized `Result` type for batchq operations.
pub type AppResult<T> = Result<T, AppError>;
