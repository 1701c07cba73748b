//! Packlog Error Types

use thiserror::Error;

/// Result type alias for packlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Packlog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    #[error("Index full")]
    IndexFull,

    #[error("Log corrupted at {path}: {reason}")]
    Corruption { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Consensus errors
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader available")]
    NoLeader,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("State error: {0}")]
    State(String),

    // Authorization errors
    #[error("{subject} not permitted to {action} to {object}")]
    PermissionDenied {
        subject: String,
        object: String,
        action: String,
    },

    #[error("Missing peer identity")]
    Unauthenticated,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("RPC error: {0}")]
    Rpc(String),

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
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::Network(_) | Error::NoLeader
        )
    }

    /// Check if this error means the handler target is not the leader.
    ///
    /// Membership events fan out to every node; non-leaders log these
    /// at debug level instead of error level.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::NotLeader(_) | Error::NoLeader)
    }
}
