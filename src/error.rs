//! PeerLock Error Types

use thiserror::Error;

/// Result type alias for PeerLock operations
pub type Result<T> = std::result::Result<T, Error>;

/// PeerLock error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // Peer errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Unexpected response from {peer}: {response}")]
    UnexpectedResponse { peer: String, response: String },

    // Directory errors
    #[error("Peer directory unavailable: {0}")]
    DirectoryUnavailable(String),

    // Protocol errors
    #[error("Cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: String,
    },

    #[error("Quorum not reached: {received}/{required} replies")]
    QuorumNotReached { received: usize, required: usize },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error means the remote peer should be treated as dead
    /// for the operation in progress
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::PeerUnreachable(_)
                | Error::Network(_)
                | Error::Io(_)
        )
    }

    /// Check if this error is retryable on the next periodic cycle
    pub fn is_retryable(&self) -> bool {
        self.is_peer_failure() || matches!(self, Error::DirectoryUnavailable(_))
    }
}
