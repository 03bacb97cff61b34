//! Actor Error Types
//!
//! - `Descriptor`: bad configuration, fatal at init
//! - `Protocol`: a message sequence that violates the actor state machine,
//!   fatal because it points at a bug in the sender or the bus
//! - `Transfer`: transport-level failure, reported upward while the actor
//!   stays alive
//! - `Kernel`: the task-specific transform failed
//!
//! Pipeline-depth exhaustion is deliberately absent: it is a stall, not an
//! error, and never leaves the actor.

use network::TransportError;
use thiserror::Error;
use types::{ActorId, DescriptorError, NodeId, PieceId, RegisterId};

#[derive(Debug, Clone, Error)]
pub enum ActorError {
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Protocol error in {actor}: {message}")]
    Protocol { actor: ActorId, message: String },

    #[error("Transfer error in {actor}: {register} {piece} from {node}: {source}")]
    Transfer {
        node: NodeId,
        actor: ActorId,
        register: RegisterId,
        piece: PieceId,
        source: TransportError,
    },

    #[error("Kernel error in {actor}: {message}")]
    Kernel { actor: ActorId, message: String },

    #[error("No route to {actor}")]
    UnknownDestination { actor: ActorId },

    #[error("Inbox of {actor} is closed")]
    InboxClosed { actor: ActorId },
}

/// Failure raised by a kernel while filling output registers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct KernelError(pub String);

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    pub fn protocol(actor: ActorId, message: impl Into<String>) -> Self {
        Self::Protocol {
            actor,
            message: message.into(),
        }
    }

    pub fn kernel(actor: ActorId, error: KernelError) -> Self {
        Self::Kernel {
            actor,
            message: error.0,
        }
    }

    /// Fatal errors abort the owning actor; transfer errors leave it alive
    /// so the graph controller can resubmit or abort.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transfer { .. })
    }

    /// Short category used as a structured log field
    pub fn category(&self) -> &'static str {
        match self {
            Self::Descriptor(_) => "descriptor",
            Self::Protocol { .. } => "protocol",
            Self::Transfer { .. } => "transfer",
            Self::Kernel { .. } => "kernel",
            Self::UnknownDestination { .. } | Self::InboxClosed { .. } => "bus",
        }
    }

    /// Actor the error is attributed to, when known
    pub fn actor(&self) -> Option<ActorId> {
        match self {
            Self::Descriptor(_) => None,
            Self::Protocol { actor, .. }
            | Self::Transfer { actor, .. }
            | Self::Kernel { actor, .. }
            | Self::UnknownDestination { actor }
            | Self::InboxClosed { actor } => Some(*actor),
        }
    }
}
