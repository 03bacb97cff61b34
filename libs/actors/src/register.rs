//! Registers and Register Pools
//!
//! A register is a fixed-capacity buffer owned by the output port of the
//! actor that produces into it. Each output port owns a `RegisterPool` with
//! exactly `pipeline_depth` slots; the pool is the only owner of physical
//! storage and bounds memory per port.
//!
//! ## Lifecycle
//!
//! ```text
//!   Free ──acquire──> InFlight (writable) ──publish──> InFlight (shared)
//!    ^                                                      │
//!    └──────── reset <── Consumed <── last Returned ────────┘
//! ```
//!
//! While writable, the producer holds the only `BytesMut`. Publishing
//! freezes it into `Bytes`, which consumers receive inside a
//! `RegisterHandle`. A slot can only become writable again after every
//! consumer has returned it; the storage is reclaimed in place when no
//! handle is still alive and reallocated otherwise, so a consumer that
//! holds on to a handle can never observe the producer's next write.
//!
//! Handles are `(slot, generation)` pairs plus the shared payload. The
//! generation bumps on every acquire, so a Returned message for an older
//! use of the same slot is detected as stale.

use bytes::{Bytes, BytesMut};
use network::MemoryToken;
use thiserror::Error;
use types::{ActorId, NodeId, PieceId, PortId, RegisterId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    /// Available to the producer
    Free,
    /// Held for one producer cycle: being written, or published and
    /// awaiting returns
    InFlight,
    /// Every consumer returned it; storage not yet reset
    Consumed,
}

/// Identity of one use of a register, as carried by Returned messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterRef {
    pub id: RegisterId,
    pub generation: u64,
    pub piece: PieceId,
}

/// Shared read-only view of a published register
///
/// When the handle crosses to another node the payload is stripped; the
/// reader then has to copy the bytes through the transport.
#[derive(Debug, Clone)]
pub struct RegisterHandle {
    id: RegisterId,
    generation: u64,
    piece: PieceId,
    node: NodeId,
    len: usize,
    payload: Option<Bytes>,
}

impl RegisterHandle {
    pub fn id(&self) -> RegisterId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn piece(&self) -> PieceId {
        self.piece
    }

    /// Node the producing actor lives on
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Payload length in bytes, known even when the payload is remote
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Local payload, `None` when the register lives on another node
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn is_remote(&self) -> bool {
        self.payload.is_none()
    }

    pub fn to_ref(&self) -> RegisterRef {
        RegisterRef {
            id: self.id,
            generation: self.generation,
            piece: self.piece,
        }
    }

    /// Token under which the payload is registered with the transport
    pub fn token(&self) -> MemoryToken {
        MemoryToken::new(self.node, self.id, self.generation)
    }

    /// Split off the payload, leaving a remote view
    pub(crate) fn detach_payload(mut self) -> (Self, Option<Bytes>) {
        let payload = self.payload.take();
        (self, payload)
    }
}

/// Why a Returned message was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReturnViolation {
    #[error("{0} does not exist in this pool")]
    UnknownSlot(RegisterId),

    #[error("{id} is at generation {current}, return names generation {returned}")]
    StaleGeneration {
        id: RegisterId,
        current: u64,
        returned: u64,
    },

    #[error("{0} was never published")]
    NotPublished(RegisterId),

    #[error("{consumer} does not hold {id}")]
    UnexpectedConsumer { id: RegisterId, consumer: ActorId },
}

/// Outcome of an accepted return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnProgress {
    /// Other consumers still hold the register
    Pending(usize),
    /// The register is Free again
    Freed,
}

#[derive(Debug)]
enum Storage {
    Writable(BytesMut),
    Published(Bytes),
    /// Buffer handed to a transfer that has not come back
    Lent,
}

#[derive(Debug)]
pub struct Register {
    id: RegisterId,
    generation: u64,
    piece: Option<PieceId>,
    state: RegisterState,
    outstanding: Vec<ActorId>,
    storage: Storage,
    capacity: usize,
}

impl Register {
    fn new(id: RegisterId, capacity: usize) -> Self {
        Self {
            id,
            generation: 0,
            piece: None,
            state: RegisterState::Free,
            outstanding: Vec::new(),
            storage: Storage::Writable(BytesMut::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn id(&self) -> RegisterId {
        self.id
    }

    pub fn state(&self) -> RegisterState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn piece(&self) -> Option<PieceId> {
        self.piece
    }

    /// Consumers that still owe a Returned message
    pub fn outstanding(&self) -> &[ActorId] {
        &self.outstanding
    }

    pub fn is_published(&self) -> bool {
        matches!(self.storage, Storage::Published(_))
    }

    pub fn is_writable(&self) -> bool {
        self.state == RegisterState::InFlight && matches!(self.storage, Storage::Writable(_))
    }

    fn ensure_writable(&mut self) -> &mut BytesMut {
        if !matches!(self.storage, Storage::Writable(_)) {
            self.storage = Storage::Writable(BytesMut::with_capacity(self.capacity));
        }
        match &mut self.storage {
            Storage::Writable(buffer) => buffer,
            _ => unreachable!("storage was just made writable"),
        }
    }

    /// Consumed -> Free, reclaiming storage when no handle is alive
    fn reset(&mut self) {
        let storage = std::mem::replace(&mut self.storage, Storage::Lent);
        let buffer = match storage {
            Storage::Published(bytes) => match bytes.try_into_mut() {
                Ok(mut buffer) => {
                    buffer.clear();
                    buffer
                }
                Err(_) => BytesMut::with_capacity(self.capacity),
            },
            Storage::Writable(mut buffer) => {
                buffer.clear();
                buffer
            }
            Storage::Lent => BytesMut::with_capacity(self.capacity),
        };
        self.storage = Storage::Writable(buffer);
        self.state = RegisterState::Free;
        self.piece = None;
    }
}

/// Fixed-size pool of registers behind one output port
#[derive(Debug)]
pub struct RegisterPool {
    producer: ActorId,
    node: NodeId,
    port: PortId,
    consumers: Vec<ActorId>,
    register_bytes: usize,
    slots: Vec<Register>,
    in_flight: usize,
}

impl RegisterPool {
    pub fn new(
        producer: ActorId,
        node: NodeId,
        port: PortId,
        depth: usize,
        register_bytes: usize,
        consumers: Vec<ActorId>,
    ) -> Self {
        let slots = (0..depth as u32)
            .map(|slot| Register::new(RegisterId::new(producer, port, slot), register_bytes))
            .collect();
        Self {
            producer,
            node,
            port,
            consumers,
            register_bytes,
            slots,
            in_flight: 0,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn register_bytes(&self) -> usize {
        self.register_bytes
    }

    pub fn consumers(&self) -> &[ActorId] {
        &self.consumers
    }

    /// Registers currently InFlight
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_free(&self) -> bool {
        self.in_flight < self.slots.len()
    }

    pub fn register(&self, slot: u32) -> Option<&Register> {
        self.slots.get(slot as usize)
    }

    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.slots.iter()
    }

    /// Take a Free register for `piece`; `None` means the pipeline depth is
    /// exhausted and the caller must stall.
    pub fn acquire(&mut self, piece: PieceId) -> Option<u32> {
        let register = self
            .slots
            .iter_mut()
            .find(|r| r.state == RegisterState::Free)?;
        register.generation += 1;
        register.piece = Some(piece);
        register.state = RegisterState::InFlight;
        register.ensure_writable();
        self.in_flight += 1;
        Some(register.id.slot)
    }

    /// Producer's exclusive write access to an acquired, unpublished register
    pub fn buffer_mut(&mut self, slot: u32) -> Option<&mut BytesMut> {
        let register = self.slots.get_mut(slot as usize)?;
        if register.state != RegisterState::InFlight || register.is_published() {
            return None;
        }
        Some(register.ensure_writable())
    }

    /// Move the write buffer out, e.g. into a transfer request
    pub fn lend_buffer(&mut self, slot: u32) -> Option<BytesMut> {
        let register = self.slots.get_mut(slot as usize)?;
        if !register.is_writable() {
            return None;
        }
        match std::mem::replace(&mut register.storage, Storage::Lent) {
            Storage::Writable(buffer) => Some(buffer),
            other => {
                register.storage = other;
                None
            }
        }
    }

    /// Give back a buffer previously lent
    pub fn restore_buffer(&mut self, slot: u32, buffer: BytesMut) -> bool {
        match self.slots.get_mut(slot as usize) {
            Some(register)
                if register.state == RegisterState::InFlight
                    && matches!(register.storage, Storage::Lent) =>
            {
                register.storage = Storage::Writable(buffer);
                true
            }
            _ => false,
        }
    }

    /// Freeze an acquired register and hand it to the port's consumers
    pub fn publish(&mut self, slot: u32) -> Option<RegisterHandle> {
        let consumers = self.consumers.clone();
        let node = self.node;
        let register = self.slots.get_mut(slot as usize)?;
        if register.state != RegisterState::InFlight || register.is_published() {
            return None;
        }
        let buffer = match std::mem::replace(&mut register.storage, Storage::Lent) {
            Storage::Writable(buffer) => buffer,
            _ => BytesMut::new(),
        };
        let payload = buffer.freeze();
        register.storage = Storage::Published(payload.clone());
        register.outstanding = consumers;

        Some(RegisterHandle {
            id: register.id,
            generation: register.generation,
            piece: register.piece.unwrap_or_default(),
            node,
            len: payload.len(),
            payload: Some(payload),
        })
    }

    /// Release an acquired register that was never published
    pub fn abandon(&mut self, slot: u32) -> bool {
        match self.slots.get_mut(slot as usize) {
            Some(register)
                if register.state == RegisterState::InFlight && !register.is_published() =>
            {
                register.reset();
                self.in_flight -= 1;
                true
            }
            _ => false,
        }
    }

    /// Record `consumer`'s return of `returned`
    pub fn on_returned(
        &mut self,
        consumer: ActorId,
        returned: RegisterRef,
    ) -> Result<ReturnProgress, ReturnViolation> {
        let id = returned.id;
        let register = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|r| r.id == id)
            .ok_or(ReturnViolation::UnknownSlot(id))?;

        if register.generation != returned.generation {
            return Err(ReturnViolation::StaleGeneration {
                id,
                current: register.generation,
                returned: returned.generation,
            });
        }
        if register.state != RegisterState::InFlight || !register.is_published() {
            return Err(ReturnViolation::NotPublished(id));
        }

        let position = register
            .outstanding
            .iter()
            .position(|c| *c == consumer)
            .ok_or(ReturnViolation::UnexpectedConsumer { id, consumer })?;
        register.outstanding.swap_remove(position);

        if !register.outstanding.is_empty() {
            return Ok(ReturnProgress::Pending(register.outstanding.len()));
        }

        register.state = RegisterState::Consumed;
        register.reset();
        self.in_flight -= 1;
        Ok(ReturnProgress::Freed)
    }

    pub fn producer(&self) -> ActorId {
        self.producer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(depth: usize, consumers: &[u64]) -> RegisterPool {
        RegisterPool::new(
            ActorId(1),
            NodeId(0),
            PortId(0),
            depth,
            16,
            consumers.iter().copied().map(ActorId).collect(),
        )
    }

    fn write(pool: &mut RegisterPool, slot: u32, bytes: &[u8]) {
        let buffer = pool.buffer_mut(slot).unwrap();
        buffer.extend_from_slice(bytes);
    }

    #[test]
    fn test_acquire_respects_depth() {
        let mut pool = pool(2, &[2]);
        assert!(pool.acquire(PieceId(0)).is_some());
        assert!(pool.acquire(PieceId(1)).is_some());
        assert_eq!(pool.in_flight(), 2);
        assert!(!pool.has_free());
        assert!(pool.acquire(PieceId(2)).is_none());
    }

    #[test]
    fn test_publish_then_return_frees_slot() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        write(&mut pool, slot, b"abc");
        let handle = pool.publish(slot).unwrap();
        assert_eq!(handle.payload().unwrap().as_ref(), b"abc");
        assert_eq!(handle.piece(), PieceId(0));
        assert!(!handle.is_remote());

        // No write access while consumers hold it
        assert!(pool.buffer_mut(slot).is_none());

        let reference = handle.to_ref();
        drop(handle);
        assert_eq!(
            pool.on_returned(ActorId(2), reference),
            Ok(ReturnProgress::Freed)
        );
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.register(slot).unwrap().state(), RegisterState::Free);
    }

    #[test]
    fn test_all_consumers_must_return() {
        let mut pool = pool(1, &[2, 3]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        let handle = pool.publish(slot).unwrap();

        assert_eq!(
            pool.on_returned(ActorId(3), handle.to_ref()),
            Ok(ReturnProgress::Pending(1))
        );
        assert!(!pool.has_free());

        // Same consumer twice is a violation
        assert!(matches!(
            pool.on_returned(ActorId(3), handle.to_ref()),
            Err(ReturnViolation::UnexpectedConsumer { .. })
        ));

        assert_eq!(
            pool.on_returned(ActorId(2), handle.to_ref()),
            Ok(ReturnProgress::Freed)
        );
        assert!(pool.has_free());
    }

    #[test]
    fn test_stale_generation_rejected() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        let first = pool.publish(slot).unwrap().to_ref();
        pool.on_returned(ActorId(2), first).unwrap();

        let slot = pool.acquire(PieceId(1)).unwrap();
        pool.publish(slot).unwrap();
        assert!(matches!(
            pool.on_returned(ActorId(2), first),
            Err(ReturnViolation::StaleGeneration { .. })
        ));
    }

    #[test]
    fn test_return_before_publish_rejected() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        let reference = RegisterRef {
            id: RegisterId::new(ActorId(1), PortId(0), slot),
            generation: pool.register(slot).unwrap().generation(),
            piece: PieceId(0),
        };
        assert_eq!(
            pool.on_returned(ActorId(2), reference),
            Err(ReturnViolation::NotPublished(reference.id))
        );
    }

    #[test]
    fn test_unknown_slot_rejected() {
        let mut pool = pool(1, &[2]);
        let reference = RegisterRef {
            id: RegisterId::new(ActorId(1), PortId(0), 5),
            generation: 1,
            piece: PieceId(0),
        };
        assert!(matches!(
            pool.on_returned(ActorId(2), reference),
            Err(ReturnViolation::UnknownSlot(_))
        ));
    }

    #[test]
    fn test_late_handle_never_sees_next_write() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        write(&mut pool, slot, b"first");
        let handle = pool.publish(slot).unwrap();

        // Consumer returns but keeps a clone of the handle alive
        let lingering = handle.clone();
        pool.on_returned(ActorId(2), handle.to_ref()).unwrap();
        drop(handle);

        let slot = pool.acquire(PieceId(1)).unwrap();
        write(&mut pool, slot, b"second");
        assert_eq!(lingering.payload().unwrap().as_ref(), b"first");
    }

    #[test]
    fn test_lend_and_restore() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        let mut buffer = pool.lend_buffer(slot).unwrap();
        assert!(pool.lend_buffer(slot).is_none());
        buffer.extend_from_slice(b"copied");
        assert!(pool.restore_buffer(slot, buffer));
        let handle = pool.publish(slot).unwrap();
        assert_eq!(handle.len(), 6);
    }

    #[test]
    fn test_abandon_unpublished() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        assert!(pool.abandon(slot));
        assert!(pool.has_free());

        let slot = pool.acquire(PieceId(1)).unwrap();
        pool.publish(slot).unwrap();
        assert!(!pool.abandon(slot));
    }

    #[test]
    fn test_detached_handle_is_remote() {
        let mut pool = pool(1, &[2]);
        let slot = pool.acquire(PieceId(0)).unwrap();
        write(&mut pool, slot, b"xyz");
        let handle = pool.publish(slot).unwrap();
        let (remote, payload) = handle.detach_payload();
        assert!(remote.is_remote());
        assert_eq!(remote.len(), 3);
        assert_eq!(payload.unwrap().as_ref(), b"xyz");
        assert_eq!(remote.token().generation, remote.generation());
    }
}
