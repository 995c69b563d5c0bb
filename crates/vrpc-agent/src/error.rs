//! Error types for agent operations

use thiserror::Error;
use vrpc_proto::ProtocolError;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid configuration; the agent refuses to start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// A publish, subscribe or unsubscribe failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ClientError> for AgentError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Transport(err.to_string())
    }
}
