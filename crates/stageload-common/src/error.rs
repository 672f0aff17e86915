//! Error types shared across stageload crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared types
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("Invalid identifier '{0}': expected [schema.]name made of letters, digits and underscores")]
    InvalidIdentifier(String),
}
