//! Error types for the record store.

use crate::types::Hash;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No record matches the given value")]
    NotFound,

    #[error("Blob not found: {0}")]
    BlobNotFound(Hash),

    #[error("Invalid database name: {0:?}")]
    InvalidName(String),

    #[error("Database {0:?} is still open elsewhere in this process")]
    DatabaseInUse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: Hash, got: Hash },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Storage task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// Whether the error means the underlying storage could not be used at all,
    /// as opposed to a lookup miss or a bad blob.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Locked
                | StoreError::NotInitialized
                | StoreError::InvalidFormat(_)
                | StoreError::InvalidName(_)
                | StoreError::DatabaseInUse(_)
                | StoreError::TaskFailed(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::TaskFailed(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
