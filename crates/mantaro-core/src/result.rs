//! Convenience result type alias for the Mantaro API.

use crate::error::AppError;

/// A specialized `Result` type for Mantaro operations.
pub type AppResult<T> = Result<T, AppError>;
