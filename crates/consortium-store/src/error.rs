//! Error types for the document store.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No document with this id
    #[error("document not found: {0}")]
    NotFound(String),

    /// Revision supplied on update does not match the stored revision
    #[error("revision conflict on {id}: expected {expected:?}, got {actual:?}")]
    Conflict {
        id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Insert of an id that is already present
    #[error("document already exists: {0}")]
    AlreadyExists(String),

    /// Document body is not usable (e.g. update without an id)
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Backend storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend does not implement an optional capability
    #[error("unsupported by backend: {0}")]
    Unsupported(&'static str),

    /// The change feed dropped notifications and cannot continue
    #[error("change feed lagged, {0} changes skipped")]
    FeedLagged(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}
