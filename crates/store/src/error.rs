use thiserror::Error;

/// Record store failure.
///
/// These are infrastructure failures (disk, snapshot encoding). Business
/// outcomes such as "record not found" are expressed by the callers' own
/// return types, never through this enum.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(String),

    #[error("snapshot could not be encoded or decoded: {0}")]
    Snapshot(String),

    /// Another handle (usually another process) already owns the store.
    #[error("store is locked by another owner: {0}")]
    Locked(String),
}
