//! Transport Error Types
//!
//! Failures reported by the transport layer, either synchronously when a
//! request is rejected or asynchronously inside a failed `TransferOutcome`.

use crate::transfer::MemoryToken;
use thiserror::Error;

/// Main transport error type
///
/// Errors are `Clone` because a failure travels inside an actor message
/// back to the actor that issued the transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Source memory was never registered or has already been withdrawn
    #[error("Unknown memory: {token}")]
    UnknownMemory { token: MemoryToken },

    /// The same register generation was registered twice
    #[error("Memory already registered: {token}")]
    AlreadyRegistered { token: MemoryToken },

    /// Destination buffer cannot hold the source payload
    #[error("Size mismatch for {token}: source is {source_len}B, destination holds {capacity}B")]
    SizeMismatch {
        token: MemoryToken,
        source_len: usize,
        capacity: usize,
    },

    /// Link-level failure while moving bytes
    #[error("Network error: {message}")]
    Network { message: String },

    /// Fault injected by a test or chaos configuration
    #[error("Injected fault: {message}")]
    Injected { message: String },

    /// The runtime driving transfers is gone
    #[error("Transport shut down")]
    Shutdown,
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an injected fault
    pub fn injected(message: impl Into<String>) -> Self {
        Self::Injected {
            message: message.into(),
        }
    }

    /// Whether resubmitting the same transfer may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Injected { .. })
    }

    /// Short category used as a structured log field
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownMemory { .. } | Self::AlreadyRegistered { .. } => "memory",
            Self::SizeMismatch { .. } => "size",
            Self::Network { .. } => "network",
            Self::Injected { .. } => "injected",
            Self::Shutdown => "shutdown",
        }
    }
}
