//! Error types for classification and aggregation.

use thiserror::Error;

/// Result type for aggregation operations.
pub type Result<T> = std::result::Result<T, AggregateError>;

/// Errors raised while classifying a store or computing a round.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    /// The store holds no aggregate document
    #[error("no aggregate document in store")]
    MissingAggregate,

    /// More than one document is flagged as the aggregate
    #[error("multiple aggregate documents: {first} and {second}")]
    DuplicateAggregate { first: String, second: String },

    /// A document could not be read as the expected type
    #[error("malformed document {id}: {reason}")]
    MalformedDocument { id: String, reason: String },

    /// A required feature is absent from a site's analysis
    #[error("feature not found for {username}: {feature}")]
    FeatureNotFound { username: String, feature: String },

    /// A feature value is not a finite number
    #[error("non-numeric value for {username}: {feature}")]
    NonNumeric { username: String, feature: String },

    /// The round holds more analyses than the consortium has clients
    #[error("more analyses than expected: {actual} submitted for {expected} clients")]
    TooManyAnalyses { expected: usize, actual: usize },

    /// Recomputation requested before every client submitted
    #[error("round incomplete: {actual} of {expected} analyses submitted")]
    IncompleteRound { expected: usize, actual: usize },

    /// Recomputation requested with nothing to aggregate
    #[error("no contributing analyses")]
    EmptyRound,

    /// Aggregation policy or seed is unusable
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}
