//! Application-wide result alias.

use crate::error::AppError;

/// Result type used throughout PBXGate.
pub type AppResult<T> = Result<T, AppError>;
