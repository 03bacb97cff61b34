//! Actor Messages
//!
//! Every interaction between actors is an `ActorMessage`: a source, a
//! destination and a `MessageKind`. Messages are moved through the bus and
//! never mutated after `send`.
//!
//! Transfer events use the requesting actor as both source and destination:
//! they are injected into the copy actor's own inbox by the bus when the
//! transport signals completion.

use crate::register::{RegisterHandle, RegisterRef};
use bytes::BytesMut;
use network::{MemoryToken, TransferEvent, TransferOutcome, TransportError};
use std::fmt;
use types::{ActorId, PieceId, PortId, RegisterId, TransferId};

/// Control commands issued by the graph controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorCommand {
    /// Kick a source actor into producing
    Start,
    /// Issue a failed transfer again
    ResubmitTransfer { piece: PieceId },
}

#[derive(Debug)]
pub enum MessageKind {
    /// A register was published for the destination to read
    Produced(RegisterHandle),
    /// The source is done reading a register the destination owns
    Returned(RegisterRef),
    /// No further Produced messages will arrive from the source's `port`
    EndOfStream { port: PortId },
    /// A transfer issued by the destination finished copying
    TransferComplete {
        transfer: TransferId,
        piece: PieceId,
        buffer: BytesMut,
    },
    /// A transfer issued by the destination failed
    TransferFailed {
        transfer: TransferId,
        piece: PieceId,
        source: MemoryToken,
        error: TransportError,
    },
    Command(ActorCommand),
}

impl MessageKind {
    /// Name used in logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Produced(_) => "produced",
            MessageKind::Returned(_) => "returned",
            MessageKind::EndOfStream { .. } => "end_of_stream",
            MessageKind::TransferComplete { .. } => "transfer_complete",
            MessageKind::TransferFailed { .. } => "transfer_failed",
            MessageKind::Command(_) => "command",
        }
    }
}

#[derive(Debug)]
pub struct ActorMessage {
    pub src: ActorId,
    pub dst: ActorId,
    pub kind: MessageKind,
}

impl ActorMessage {
    pub fn new(src: ActorId, dst: ActorId, kind: MessageKind) -> Self {
        Self { src, dst, kind }
    }

    pub fn produced(src: ActorId, dst: ActorId, handle: RegisterHandle) -> Self {
        Self::new(src, dst, MessageKind::Produced(handle))
    }

    pub fn returned(src: ActorId, dst: ActorId, register: RegisterRef) -> Self {
        Self::new(src, dst, MessageKind::Returned(register))
    }

    pub fn end_of_stream(src: ActorId, dst: ActorId, port: PortId) -> Self {
        Self::new(src, dst, MessageKind::EndOfStream { port })
    }

    pub fn command(src: ActorId, dst: ActorId, command: ActorCommand) -> Self {
        Self::new(src, dst, MessageKind::Command(command))
    }

    /// Transport event as a message to the requesting actor itself
    pub fn from_transfer_event(event: TransferEvent) -> Self {
        let TransferEvent {
            id,
            requester,
            source,
            piece,
            outcome,
        } = event;
        let kind = match outcome {
            TransferOutcome::Completed { buffer } => MessageKind::TransferComplete {
                transfer: id,
                piece,
                buffer,
            },
            TransferOutcome::Failed { error } => MessageKind::TransferFailed {
                transfer: id,
                piece,
                source,
                error,
            },
        };
        Self::new(requester, requester, kind)
    }

    /// Piece marker carried by the message, if any
    pub fn piece(&self) -> Option<PieceId> {
        match &self.kind {
            MessageKind::Produced(handle) => Some(handle.piece()),
            MessageKind::Returned(register) => Some(register.piece),
            MessageKind::TransferComplete { piece, .. }
            | MessageKind::TransferFailed { piece, .. } => Some(*piece),
            MessageKind::Command(ActorCommand::ResubmitTransfer { piece }) => Some(*piece),
            MessageKind::EndOfStream { .. } | MessageKind::Command(ActorCommand::Start) => None,
        }
    }

    /// Register referenced by the message, if any
    pub fn register(&self) -> Option<RegisterId> {
        match &self.kind {
            MessageKind::Produced(handle) => Some(handle.id()),
            MessageKind::Returned(register) => Some(register.id),
            MessageKind::TransferFailed { source, .. } => Some(source.register),
            _ => None,
        }
    }
}

impl fmt::Display for ActorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind.name(), self.src, self.dst)?;
        if let Some(piece) = self.piece() {
            write!(f, " {piece}")?;
        }
        Ok(())
    }
}
