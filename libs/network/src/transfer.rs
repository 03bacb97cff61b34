//! Transfer Contract
//!
//! The interface the actor runtime consumes from the transport layer:
//!
//! - A producer's payload is made readable from other nodes by registering
//!   it under a `MemoryToken`
//! - `begin_transfer` copies a registered payload into a destination buffer
//!   owned by the requester; the call returns immediately
//! - Every accepted transfer yields exactly one `TransferEvent`, delivered
//!   through the `CompletionNotifier` passed with the request
//!
//! The destination buffer moves into the request and comes back inside the
//! completed outcome, so the requester never shares it while bytes land.

use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use types::{ActorId, NodeId, PieceId, RegisterId, TransferId};

/// Handle to a payload registered with the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryToken {
    pub node: NodeId,
    pub register: RegisterId,
    /// Register generation, so a reused slot never aliases a stale token
    pub generation: u64,
}

impl MemoryToken {
    pub const fn new(node: NodeId, register: RegisterId, generation: u64) -> Self {
        Self {
            node,
            register,
            generation,
        }
    }
}

impl fmt::Display for MemoryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.register, self.node, self.generation)
    }
}

/// Request to copy a registered payload into `dest`
#[derive(Debug)]
pub struct TransferRequest {
    pub id: TransferId,
    pub requester: ActorId,
    pub source: MemoryToken,
    pub piece: PieceId,
    pub dest: BytesMut,
}

/// How a transfer ended
#[derive(Debug)]
pub enum TransferOutcome {
    /// `buffer` holds the copied payload
    Completed { buffer: BytesMut },
    Failed { error: TransportError },
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. })
    }
}

/// Completion or failure of one accepted transfer
#[derive(Debug)]
pub struct TransferEvent {
    pub id: TransferId,
    pub requester: ActorId,
    pub source: MemoryToken,
    pub piece: PieceId,
    pub outcome: TransferOutcome,
}

impl TransferEvent {
    pub fn completed(request: TransferRequest) -> Self {
        Self {
            id: request.id,
            requester: request.requester,
            source: request.source,
            piece: request.piece,
            outcome: TransferOutcome::Completed {
                buffer: request.dest,
            },
        }
    }

    pub fn failed(request: &TransferRequest, error: TransportError) -> Self {
        Self {
            id: request.id,
            requester: request.requester,
            source: request.source,
            piece: request.piece,
            outcome: TransferOutcome::Failed { error },
        }
    }
}

/// Receives transfer events on behalf of the requesting actor
///
/// Implementations must not run actor code; they only enqueue the event so
/// the requesting actor observes it from its own thread.
pub trait CompletionNotifier: Send + Sync {
    fn notify(&self, event: TransferEvent);
}

/// Byte transport between nodes
pub trait Transport: Send + Sync {
    /// Expose `payload` to remote readers under `token`
    fn register_memory(&self, token: MemoryToken, payload: Bytes) -> Result<()>;

    /// Withdraw a registration, returning the payload it held
    fn unregister_memory(&self, token: &MemoryToken) -> Result<Bytes>;

    /// Start copying `request.source` into `request.dest` without blocking
    ///
    /// On `Ok` exactly one event reaches `notifier`. On `Err` the request was
    /// rejected and no event follows.
    fn begin_transfer(
        &self,
        request: TransferRequest,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Result<TransferId>;

    fn metrics(&self) -> Arc<TransportMetrics>;
}

/// Copy `source` into `dest`, reusing the destination allocation
pub(crate) fn fill_destination(
    token: MemoryToken,
    source: &[u8],
    dest: &mut BytesMut,
) -> Result<()> {
    let capacity = dest.capacity().max(dest.len());
    if source.len() > capacity {
        return Err(TransportError::SizeMismatch {
            token,
            source_len: source.len(),
            capacity,
        });
    }
    dest.clear();
    dest.extend_from_slice(source);
    Ok(())
}
