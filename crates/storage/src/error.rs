//! Engine error model.
//!
//! Absence is not an error here: reads return `Option` and removals of
//! unknown records are no-ops. Errors are reserved for bad input, lock
//! contention that outlived its deadline, and store failures.

use std::time::Duration;

use thiserror::Error;

use jobvault_core::{JobId, ValidationError};
use jobvault_store::StoreError;

/// Result type used across the engine.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage engine error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Caller input rejected before any transaction was opened.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A mutating call targeted a job that does not exist (or already expired).
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The record store failed; carries the operation and record key.
    #[error("{operation} failed for '{key}': {source}")]
    Store {
        operation: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StorageError {
    /// Attach operation/key context to a store failure. Other variants pass
    /// through unchanged.
    pub fn context(self, operation: &'static str, key: impl Into<String>) -> Self {
        match self {
            StorageError::Store { source, .. } => StorageError::Store {
                operation,
                key: key.into(),
                source,
            },
            other => other,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, StorageError::Validation(_))
    }
}

impl From<StoreError> for StorageError {
    fn from(source: StoreError) -> Self {
        StorageError::Store {
            operation: "transaction",
            key: String::new(),
            source,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Distributed lock error.
#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The lock stayed held by someone else for the whole timeout.
    #[error("timed out after {timeout:?} waiting for lock on '{resource}'")]
    Timeout { resource: String, timeout: Duration },

    /// The store failed while trying to take the lock.
    #[error("failed to acquire lock on '{resource}'")]
    Acquisition {
        resource: String,
        #[source]
        source: StoreError,
    },

    /// The store failed while releasing or refreshing a held lock.
    #[error("failed to release lock on '{resource}'")]
    Release {
        resource: String,
        #[source]
        source: StoreError,
    },
}

impl LockError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}
