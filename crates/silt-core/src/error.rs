//! Error types for silt-core

use thiserror::Error;

/// Result type alias using silt-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in silt-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Entity type has no registered sync configuration
    #[error("Unregistered entity type: {0}")]
    UnregisteredEntityType(String),

    /// Payload variant does not match the record's entity type
    #[error("Payload mismatch: record says {expected}, payload is {actual}")]
    PayloadMismatch { expected: String, actual: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
