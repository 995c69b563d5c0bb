//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Topic does not match the dispatch scheme
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Topic segment contains reserved characters
    #[error("Invalid topic segment: {0}")]
    InvalidSegment(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}
