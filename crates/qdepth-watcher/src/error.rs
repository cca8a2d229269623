//! Watcher registry error types.

use thiserror::Error;

/// Errors that can occur while adding or removing watchers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid watcher spec '{key}': {reason}")]
    InvalidSpec { key: String, reason: String },

    #[error("deployment {deployment} is already watched by '{existing}'")]
    DuplicateDeployment { deployment: String, existing: String },

    #[error("no watcher registered for '{0}'")]
    NotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
