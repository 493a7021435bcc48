//! Error types for the consortium node.

use consortium_aggregate::AggregateError;
use consortium_store::StoreError;
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Document store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Classification or aggregation error
    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Access policy could not be applied
    #[error("Security error: {0}")]
    Security(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
