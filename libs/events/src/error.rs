//! Error types for the resource model.

use thiserror::Error;

/// Errors that can occur when interpreting resource fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The operation annotation carries an unknown value.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// A machine phase string is not recognized.
    #[error("unknown machine phase: {0}")]
    UnknownPhase(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
