//! Error types for the operation store.

use thiserror::Error;

/// Result type alias for operation store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during operation store calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
