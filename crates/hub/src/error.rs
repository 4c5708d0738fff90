//! Error types for the hub crate.

use thiserror::Error;

/// Errors surfaced by the consumer-facing hub API.
#[derive(Debug, Error)]
pub enum HubError {
    /// Underlying protocol failure (serialization, crypto, connection).
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// The broker task is no longer running.
    #[error("broker is no longer running")]
    BrokerClosed,

    /// Authentication failed or the handshake response was malformed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
