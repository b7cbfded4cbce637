//! Error types for TSS coordination

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a keygen or keysign session
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid engine or request configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed caller request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Quorum was not reached before the join deadline
    #[error("Join party timeout: {0}")]
    JoinPartyTimeout(String),

    /// A cryptographic round stalled
    #[error("Round timeout: {0}")]
    RoundTimeout(String),

    /// A peer's contribution failed local verification
    #[error("Invalid share: {0}")]
    InvalidShare(String),

    /// The local node is not part of the requested party set
    #[error("Local node is not a participant")]
    NotParticipant,

    /// Final signature or keygen output did not validate
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Network/transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// State store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// The engine stop signal fired
    #[error("Engine stopped")]
    Stopped,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
