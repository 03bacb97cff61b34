//! Test helpers
//!
//! - `RecordingContext` captures everything an actor sends and collects
//!   transport events so a test can feed them back in any order
//! - `ManualTransport` holds every accepted transfer until the test
//!   completes or fails it
//! - `TaskBuilder` builds descriptors and standalone register handles

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::messages::{ActorMessage, MessageKind};
use crate::register::{RegisterHandle, RegisterPool};
use bytes::Bytes;
use network::{
    CompletionNotifier, MemoryToken, TransferEvent, TransferRequest, Transport, TransportError,
    TransportMetrics,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use types::{
    ActorId, ActorKind, InputPortDescriptor, NodeId, OutputPortDescriptor, PieceId, PortId,
    TaskDescriptor, TransferId, WorkerId,
};

/// Collects transfer events instead of routing them
#[derive(Debug, Default)]
struct EventSink(Mutex<Vec<TransferEvent>>);

impl CompletionNotifier for EventSink {
    fn notify(&self, event: TransferEvent) {
        self.0.lock().push(event);
    }
}

/// Execution context that records outbound messages
#[derive(Debug, Default)]
pub struct RecordingContext {
    pub sent: Vec<ActorMessage>,
    events: Arc<EventSink>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn of_kind(&self, pred: impl Fn(&MessageKind) -> bool) -> Vec<&ActorMessage> {
        self.sent.iter().filter(|m| pred(&m.kind)).collect()
    }

    pub fn produced(&self) -> Vec<&ActorMessage> {
        self.of_kind(|k| matches!(k, MessageKind::Produced(_)))
    }

    pub fn produced_handles(&self) -> Vec<RegisterHandle> {
        self.sent
            .iter()
            .filter_map(|m| match &m.kind {
                MessageKind::Produced(handle) => Some(handle.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn returned(&self) -> Vec<&ActorMessage> {
        self.of_kind(|k| matches!(k, MessageKind::Returned(_)))
    }

    pub fn end_of_streams(&self) -> Vec<&ActorMessage> {
        self.of_kind(|k| matches!(k, MessageKind::EndOfStream { .. }))
    }

    /// Drain recorded transport events as actor messages
    pub fn take_transfer_events(&mut self) -> Vec<ActorMessage> {
        std::mem::take(&mut *self.events.0.lock())
            .into_iter()
            .map(ActorMessage::from_transfer_event)
            .collect()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

impl ExecutionContext for RecordingContext {
    fn worker(&self) -> WorkerId {
        WorkerId(0)
    }

    fn send(&mut self, msg: ActorMessage) -> Result<()> {
        self.sent.push(msg);
        Ok(())
    }

    fn notifier(&self) -> Arc<dyn CompletionNotifier> {
        self.events.clone()
    }
}

struct HeldTransfer {
    request: TransferRequest,
    notifier: Arc<dyn CompletionNotifier>,
}

/// Transport whose transfers finish only when the test says so
#[derive(Default)]
pub struct ManualTransport {
    memory: Mutex<HashMap<MemoryToken, Bytes>>,
    held: Mutex<Vec<HeldTransfer>>,
    issued: Mutex<u64>,
    metrics: Arc<TransportMetrics>,
}

impl std::fmt::Debug for ManualTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTransport")
            .field("registered", &self.memory.lock().len())
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl ManualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload directly, bypassing the bus
    pub fn expose(&self, token: MemoryToken, payload: Bytes) {
        self.memory.lock().insert(token, payload);
    }

    pub fn registered(&self) -> usize {
        self.memory.lock().len()
    }

    /// Transfers accepted so far
    pub fn issued(&self) -> u64 {
        *self.issued.lock()
    }

    /// Pieces of transfers not yet completed or failed
    pub fn held_pieces(&self) -> Vec<PieceId> {
        self.held.lock().iter().map(|h| h.request.piece).collect()
    }

    fn take(&self, piece: PieceId) -> Option<HeldTransfer> {
        let mut held = self.held.lock();
        let index = held.iter().position(|h| h.request.piece == piece)?;
        Some(held.remove(index))
    }

    /// Copy the payload for `piece` and notify; false if nothing is held
    pub fn complete_piece(&self, piece: PieceId) -> bool {
        let Some(HeldTransfer {
            mut request,
            notifier,
        }) = self.take(piece)
        else {
            return false;
        };
        let payload = self
            .memory
            .lock()
            .get(&request.source)
            .cloned()
            .unwrap_or_default();
        request.dest.clear();
        request.dest.extend_from_slice(&payload);
        self.metrics
            .record_completed(payload.len(), std::time::Duration::ZERO);
        notifier.notify(TransferEvent::completed(request));
        true
    }

    pub fn fail_piece(&self, piece: PieceId, error: TransportError) -> bool {
        let Some(held) = self.take(piece) else {
            return false;
        };
        self.metrics.record_failed();
        held.notifier
            .notify(TransferEvent::failed(&held.request, error));
        true
    }

    /// Complete everything held, in the given piece order
    pub fn complete_in_order(&self, pieces: &[PieceId]) {
        for piece in pieces {
            self.complete_piece(*piece);
        }
    }
}

impl Transport for ManualTransport {
    fn register_memory(&self, token: MemoryToken, payload: Bytes) -> network::Result<()> {
        let mut memory = self.memory.lock();
        if memory.contains_key(&token) {
            return Err(TransportError::AlreadyRegistered { token });
        }
        memory.insert(token, payload);
        self.metrics.record_registered();
        Ok(())
    }

    fn unregister_memory(&self, token: &MemoryToken) -> network::Result<Bytes> {
        let payload = self
            .memory
            .lock()
            .remove(token)
            .ok_or(TransportError::UnknownMemory { token: *token })?;
        self.metrics.record_unregistered();
        Ok(payload)
    }

    fn begin_transfer(
        &self,
        request: TransferRequest,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> network::Result<TransferId> {
        if !self.memory.lock().contains_key(&request.source) {
            self.metrics.record_rejected();
            return Err(TransportError::UnknownMemory {
                token: request.source,
            });
        }
        let id = request.id;
        *self.issued.lock() += 1;
        self.metrics.record_started();
        self.held.lock().push(HeldTransfer { request, notifier });
        Ok(id)
    }

    fn metrics(&self) -> Arc<TransportMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// Builder for task descriptors used in tests
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: TaskDescriptor,
}

impl TaskBuilder {
    fn base(id: u64, kind: ActorKind, kernel: Option<&str>) -> Self {
        Self {
            task: TaskDescriptor {
                id: ActorId(id),
                node: NodeId(0),
                kind,
                kernel: kernel.map(str::to_string),
                inputs: Vec::new(),
                outputs: Vec::new(),
                pipeline_depth: None,
                max_pieces: None,
            },
        }
    }

    /// Compute source running the `counter` kernel
    pub fn source(id: u64, max_pieces: u64) -> Self {
        let mut builder = Self::base(id, ActorKind::Compute, Some("counter"));
        builder.task.max_pieces = Some(max_pieces);
        builder
    }

    pub fn compute(id: u64, kernel: &str) -> Self {
        Self::base(id, ActorKind::Compute, Some(kernel))
    }

    pub fn network_copy(id: u64, node: u32) -> Self {
        Self::base(id, ActorKind::NetworkCopy, None).node(node)
    }

    pub fn node(mut self, node: u32) -> Self {
        self.task.node = NodeId(node);
        self
    }

    pub fn input(mut self, port: u32, producer: u64, producer_port: u32) -> Self {
        self.task.inputs.push(InputPortDescriptor {
            id: PortId(port),
            producer: ActorId(producer),
            producer_port: PortId(producer_port),
        });
        self
    }

    pub fn output(mut self, port: u32, consumers: &[u64], register_bytes: usize) -> Self {
        self.task.outputs.push(OutputPortDescriptor {
            id: PortId(port),
            consumers: consumers.iter().copied().map(ActorId).collect(),
            register_bytes,
            pipeline_depth: None,
        });
        self
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.task.pipeline_depth = Some(depth);
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.task
    }

    /// Published handle from `producer`'s `port` on node 0
    pub fn handle(producer: u64, port: u32, piece: u64, payload: &[u8]) -> RegisterHandle {
        Self::handle_on(NodeId(0), producer, port, piece, payload)
    }

    pub fn handle_on(
        node: NodeId,
        producer: u64,
        port: u32,
        piece: u64,
        payload: &[u8],
    ) -> RegisterHandle {
        Self::publish_on(node, producer, port, piece, payload, 0)
    }

    /// Publish from a one-slot pool after `recycled` earlier uses of the
    /// slot, so the handle's generation is `recycled + 1`
    fn publish_on(
        node: NodeId,
        producer: u64,
        port: u32,
        piece: u64,
        payload: &[u8],
        recycled: u64,
    ) -> RegisterHandle {
        let mut pool = RegisterPool::new(
            ActorId(producer),
            node,
            PortId(port),
            1,
            payload.len().max(1),
            vec![ActorId(u64::MAX)],
        );
        for _ in 0..recycled {
            let slot = pool
                .acquire(PieceId(piece))
                .expect("fresh pool has a free register");
            assert!(pool.abandon(slot));
        }
        let slot = pool
            .acquire(PieceId(piece))
            .expect("fresh pool has a free register");
        if let Some(buffer) = pool.buffer_mut(slot) {
            buffer.extend_from_slice(payload);
        }
        pool.publish(slot).expect("acquired register publishes")
    }

    /// Handle as a consumer on another node sees it, with the payload
    /// exposed through `transport` instead of attached. Each piece gets its
    /// own generation and so its own memory token.
    pub fn remote_handle(
        transport: &ManualTransport,
        producer: u64,
        port: u32,
        piece: u64,
        payload: &[u8],
    ) -> RegisterHandle {
        let handle = Self::publish_on(NodeId(0), producer, port, piece, payload, piece);
        let (remote, payload) = handle.detach_payload();
        transport.expose(remote.token(), payload.unwrap_or_default());
        remote
    }
}
