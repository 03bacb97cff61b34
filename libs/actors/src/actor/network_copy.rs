//! Network Copy Actor
//!
//! Makes a register produced on another node readable by local consumers.
//! For every Produced it reserves a local register, asks the transport to
//! copy the remote payload into it and records a pending entry keyed by
//! `(source actor, piece)`. The transport answers through the bus with a
//! TransferComplete or TransferFailed message in the actor's own inbox, so
//! the actor thread never blocks on a copy.
//!
//! Completions may arrive in any order. Entries live in a `BTreeMap` and
//! are released from the front only, so consumers always see pieces in
//! order. A failed entry stays at its position and blocks later pieces
//! until a `ResubmitTransfer` command retries it.
//!
//! Produced registers that arrive while every local register is in use
//! wait in the input queue in arrival order and are issued as soon as a
//! Returned frees a slot.

use super::base::ActorCore;
use crate::context::ExecutionContext;
use crate::error::{ActorError, Result};
use crate::messages::{ActorCommand, ActorMessage, MessageKind};
use crate::register::RegisterHandle;
use bytes::BytesMut;
use network::{TransferRequest, Transport, TransportError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use types::{ActorId, PieceId, TransferId};

#[derive(Debug)]
enum TransferStatus {
    Issued,
    Completed,
    Failed(TransportError),
}

#[derive(Debug)]
struct PendingTransfer {
    transfer: Option<TransferId>,
    source: RegisterHandle,
    slot: u32,
    attempts: u32,
    status: TransferStatus,
}

pub struct NetworkCopyActor {
    pub(crate) core: ActorCore,
    transport: Arc<dyn Transport>,
    pending: BTreeMap<(ActorId, PieceId), PendingTransfer>,
    by_transfer: HashMap<TransferId, (ActorId, PieceId)>,
    next_transfer: u64,
}

impl fmt::Debug for NetworkCopyActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCopyActor")
            .field("core", &self.core)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl NetworkCopyActor {
    pub fn new(core: ActorCore, transport: Arc<dyn Transport>) -> Self {
        // Transfer ids only need to be unique per requester
        let next_transfer = core.id.get() << 32;
        Self {
            core,
            transport,
            pending: BTreeMap::new(),
            by_transfer: HashMap::new(),
            next_transfer,
        }
    }

    /// Transfers issued, completed or failed but not yet released
    pub fn pending_transfers(&self) -> usize {
        self.pending.len()
    }

    /// Produced registers waiting for a free local register
    pub fn waiting(&self) -> usize {
        self.core.inputs.first().map_or(0, |i| i.queue.len())
    }

    pub(crate) fn process(&mut self, msg: ActorMessage, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let ActorMessage { src, kind, .. } = msg;
        let outcome = match kind {
            MessageKind::Produced(handle) => {
                self.core.accept_produced(src, handle)?;
                self.issue_waiting(ctx)
            }
            MessageKind::Returned(register) => {
                self.core.accept_returned(src, register)?;
                self.issue_waiting(ctx)
            }
            MessageKind::EndOfStream { port } => {
                self.core.accept_end_of_stream(src, port)?;
                Ok(())
            }
            MessageKind::TransferComplete {
                transfer,
                piece,
                buffer,
            } => self.on_transfer_complete(transfer, piece, buffer),
            MessageKind::TransferFailed {
                transfer,
                piece,
                error,
                ..
            } => self.on_transfer_failed(transfer, piece, error),
            MessageKind::Command(ActorCommand::ResubmitTransfer { piece }) => {
                self.resubmit(piece, ctx)
            }
            MessageKind::Command(ActorCommand::Start) => {
                Err(self.core.protocol("Start sent to a network copy actor"))
            }
        };

        // Release and finalize even when a transfer failed so the actor
        // keeps serving other pieces
        self.release_in_order(ctx)?;
        self.try_finalize(ctx)?;
        outcome
    }

    /// Move waiting registers into transfers while local registers are free
    fn issue_waiting(&mut self, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let mut first_error = None;
        loop {
            let Some(input) = self.core.inputs.first() else {
                break;
            };
            if input.queue.is_empty() {
                break;
            }
            if !self.core.outputs_free() {
                self.core.note_stall();
                break;
            }
            self.core.clear_stall();

            let Some(source) = self.core.inputs[0].queue.pop_front() else {
                break;
            };
            if let Err(e) = self.issue(source, ctx) {
                if e.is_fatal() {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn issue(&mut self, source: RegisterHandle, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let piece = source.piece();
        let producer = source.id().producer;
        let pool = &mut self.core.outputs[0].pool;
        let Some(slot) = pool.acquire(piece) else {
            return Err(self.core.protocol("issued a transfer without a free register"));
        };

        let mut entry = PendingTransfer {
            transfer: None,
            source,
            slot,
            attempts: 0,
            status: TransferStatus::Issued,
        };

        let result = if entry.source.is_remote() {
            self.begin(&mut entry, ctx)
        } else {
            self.copy_local(&mut entry)
        };
        self.pending.insert((producer, piece), entry);
        result
    }

    /// Same-node producer: the payload is already readable
    fn copy_local(&mut self, entry: &mut PendingTransfer) -> Result<()> {
        let pool = &mut self.core.outputs[0].pool;
        let capacity = pool.register_bytes();
        let payload = entry.source.payload().cloned().unwrap_or_default();
        if payload.len() > capacity {
            let error = TransportError::SizeMismatch {
                token: entry.source.token(),
                source_len: payload.len(),
                capacity,
            };
            return Err(self.fail(entry, error));
        }
        if let Some(buffer) = pool.buffer_mut(entry.slot) {
            buffer.clear();
            buffer.extend_from_slice(&payload);
        }
        entry.status = TransferStatus::Completed;
        trace!(actor_id = %self.core.id, piece = %entry.source.piece(), "Local copy");
        Ok(())
    }

    fn begin(&mut self, entry: &mut PendingTransfer, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let pool = &mut self.core.outputs[0].pool;
        // A buffer lost with a rejected request is reallocated here
        let dest = match pool.buffer_mut(entry.slot) {
            Some(buffer) => {
                buffer.clear();
                pool.lend_buffer(entry.slot).unwrap_or_default()
            }
            None => BytesMut::new(),
        };

        let id = TransferId(self.next_transfer);
        self.next_transfer += 1;
        entry.attempts += 1;
        let request = TransferRequest {
            id,
            requester: self.core.id,
            source: entry.source.token(),
            piece: entry.source.piece(),
            dest,
        };

        match self.transport.begin_transfer(request, ctx.notifier()) {
            Ok(id) => {
                self.by_transfer
                    .insert(id, (entry.source.id().producer, entry.source.piece()));
                entry.transfer = Some(id);
                entry.status = TransferStatus::Issued;
                self.core.metrics.record_transfer_issued();
                debug!(
                    actor_id = %self.core.id,
                    transfer = %id,
                    register = %entry.source.id(),
                    piece = %entry.source.piece(),
                    attempt = entry.attempts,
                    "Transfer issued"
                );
                Ok(())
            }
            Err(error) => Err(self.fail(entry, error)),
        }
    }

    fn fail(&self, entry: &mut PendingTransfer, error: TransportError) -> ActorError {
        self.core.metrics.record_transfer_failed();
        warn!(
            actor_id = %self.core.id,
            register = %entry.source.id(),
            piece = %entry.source.piece(),
            error = %error,
            "Transfer failed"
        );
        entry.transfer = None;
        entry.status = TransferStatus::Failed(error.clone());
        self.transfer_error(&entry.source, error)
    }

    fn transfer_error(&self, source: &RegisterHandle, error: TransportError) -> ActorError {
        ActorError::Transfer {
            node: source.node(),
            actor: self.core.id,
            register: source.id(),
            piece: source.piece(),
            source: error,
        }
    }

    fn on_transfer_complete(&mut self, transfer: TransferId, piece: PieceId, buffer: BytesMut) -> Result<()> {
        let key = self
            .by_transfer
            .remove(&transfer)
            .ok_or_else(|| self.core.protocol(format!("completion for unknown {transfer}")))?;
        let entry = self
            .pending
            .get_mut(&key)
            .ok_or_else(|| self.core.protocol(format!("completion for released {transfer}")))?;
        if key.1 != piece || !matches!(entry.status, TransferStatus::Issued) {
            return Err(self
                .core
                .protocol(format!("{transfer} completed {piece} out of protocol")));
        }

        self.core.outputs[0].pool.restore_buffer(entry.slot, buffer);
        entry.status = TransferStatus::Completed;
        self.core.metrics.record_transfer_completed();
        trace!(actor_id = %self.core.id, transfer = %transfer, piece = %piece, "Transfer complete");
        Ok(())
    }

    fn on_transfer_failed(&mut self, transfer: TransferId, piece: PieceId, error: TransportError) -> Result<()> {
        let key = self
            .by_transfer
            .remove(&transfer)
            .ok_or_else(|| self.core.protocol(format!("failure for unknown {transfer}")))?;
        let mut entry = self
            .pending
            .remove(&key)
            .ok_or_else(|| self.core.protocol(format!("failure for released {transfer}")))?;
        if key.1 != piece {
            return Err(self
                .core
                .protocol(format!("{transfer} failed for {piece}, issued for {}", key.1)));
        }
        let err = self.fail(&mut entry, error);
        self.pending.insert(key, entry);
        Err(err)
    }

    fn resubmit(&mut self, piece: PieceId, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let key = self
            .pending
            .iter()
            .find(|(key, _)| key.1 == piece)
            .map(|(key, _)| *key)
            .ok_or_else(|| self.core.protocol(format!("resubmit of unknown {piece}")))?;
        let mut entry = self
            .pending
            .remove(&key)
            .ok_or_else(|| self.core.protocol(format!("resubmit of unknown {piece}")))?;

        let TransferStatus::Failed(last_error) = &entry.status else {
            self.pending.insert(key, entry);
            return Err(self
                .core
                .protocol(format!("resubmit of {piece} which has not failed")));
        };

        debug!(
            actor_id = %self.core.id,
            piece = %piece,
            attempt = entry.attempts + 1,
            last_error = %last_error,
            "Resubmitting transfer"
        );
        let result = if entry.source.is_remote() {
            self.begin(&mut entry, ctx)
        } else {
            self.copy_local(&mut entry)
        };
        self.pending.insert(key, entry);
        result
    }

    /// Publish completed copies from the front of the pending map
    fn release_in_order(&mut self, ctx: &mut dyn ExecutionContext) -> Result<()> {
        while let Some(entry) = self.pending.first_entry() {
            if !matches!(entry.get().status, TransferStatus::Completed) {
                break;
            }
            let entry = entry.remove();
            let id = self.core.id;
            let pool = &mut self.core.outputs[0].pool;
            let handle = pool
                .publish(entry.slot)
                .ok_or_else(|| ActorError::protocol(id, "completed copy could not be published"))?;
            for consumer in pool.consumers() {
                ctx.send(ActorMessage::produced(id, *consumer, handle.clone()))?;
            }
            self.core.metrics.record_produced(pool.consumers().len() as u64);
            self.core.metrics.record_fire();

            let source = entry.source.to_ref();
            drop(entry);
            ctx.send(ActorMessage::returned(id, source.id.producer, source))?;
            debug!(actor_id = %id, piece = %source.piece, "Released copy");
        }
        Ok(())
    }

    /// EndOfStream goes downstream only after the input closed and every
    /// queued or pending piece was released
    fn try_finalize(&mut self, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let drained = self.core.inputs.iter().all(|i| i.is_drained());
        if drained && self.pending.is_empty() {
            self.core.finalize(ctx)?;
        }
        self.core.check_terminal();
        Ok(())
    }
}
