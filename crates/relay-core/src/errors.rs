//! Error types for the relay
//!
//! Every protocol-level failure is recovered locally by the session task and
//! reported to the affected party as a typed `error` notification, so each
//! variant maps to a wire-level [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PickupCode, Role};

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while coordinating a transfer
#[derive(Debug, Error)]
pub enum RelayError {
    /// Unknown or expired pickup code
    #[error("Invalid or expired pickup code: {0}")]
    InvalidCode(PickupCode),

    /// Receiver slot of the session is already occupied
    #[error("Pickup code {0} has already been claimed")]
    CodeAlreadyClaimed(PickupCode),

    #[error("Out of order chunk: expected index {expected}, got {received}")]
    OutOfOrderChunk { expected: u64, received: u64 },

    /// The sender ignored stop-and-wait and sent before the previous ack
    #[error("Chunk {received} sent before chunk {pending} was acknowledged")]
    ChunkBeforeAck { pending: u64, received: u64 },

    /// Chunk or download before `file-info`
    #[error("File metadata has not been provided for session {0}")]
    MissingMetadata(PickupCode),

    #[error("File metadata for session {0} is already set")]
    MetadataAlreadySet(PickupCode),

    /// Chunk arrived with no download stream attached
    #[error("No download stream is attached to session {0}")]
    SinkUnavailable(PickupCode),

    #[error("The {role} has disconnected")]
    PeerDisconnected { role: Role },

    /// Message came from a connection that does not hold the required role
    #[error("Connection is not the {role} of session {code}")]
    NotParticipant { code: PickupCode, role: Role },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Could not allocate a free pickup code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Wire-level classification carried by `error` notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidCode,
    CodeAlreadyClaimed,
    OutOfOrderChunk,
    MissingMetadata,
    MetadataAlreadySet,
    SinkUnavailable,
    PeerDisconnected,
    NotParticipant,
    InvalidState,
    Internal,
}

impl RelayError {
    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a peer disconnected error
    pub fn disconnected(role: Role) -> Self {
        Self::PeerDisconnected { role }
    }

    /// Classification reported to clients
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCode(_) => ErrorKind::InvalidCode,
            Self::CodeAlreadyClaimed(_) => ErrorKind::CodeAlreadyClaimed,
            Self::OutOfOrderChunk { .. } | Self::ChunkBeforeAck { .. } => ErrorKind::OutOfOrderChunk,
            Self::MissingMetadata(_) => ErrorKind::MissingMetadata,
            Self::MetadataAlreadySet(_) => ErrorKind::MetadataAlreadySet,
            Self::SinkUnavailable(_) => ErrorKind::SinkUnavailable,
            Self::PeerDisconnected { .. } => ErrorKind::PeerDisconnected,
            Self::NotParticipant { .. } => ErrorKind::NotParticipant,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::CodeSpaceExhausted { .. }
            | Self::Storage { .. }
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Config { .. } => ErrorKind::Internal,
        }
    }

    /// Disconnect-class errors trigger state transitions instead of being no-ops
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::PeerDisconnected { .. })
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}
