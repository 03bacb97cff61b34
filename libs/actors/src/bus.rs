//! Message Bus
//!
//! Delivers each `ActorMessage` exactly once to the inbox of the worker
//! thread hosting its destination. Every worker inbox is a single unbounded
//! tokio channel, so messages from one sender to one destination keep their
//! send order; nothing is promised across senders.
//!
//! ## Cross-node Produced
//!
//! When a Produced message crosses a node boundary the bus registers the
//! payload with the transport under the handle's `MemoryToken` and delivers
//! a handle without payload. The remote reader then has to copy the bytes.
//! Registrations are reference counted per token (one per remote consumer)
//! and withdrawn when the last matching Returned travels back.
//!
//! The bus also implements `CompletionNotifier`: transport events become
//! TransferComplete / TransferFailed messages injected into the requesting
//! actor's own inbox.

use crate::error::{ActorError, Result};
use crate::messages::{ActorMessage, MessageKind};
use network::{CompletionNotifier, MemoryToken, TransferEvent, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use types::{ActorId, NodeId, WorkerId};

/// Item in a worker thread's inbox
#[derive(Debug)]
pub enum Envelope {
    Message(ActorMessage),
    /// Ask the worker loop to exit
    Stop,
}

pub type Inbox = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Clone)]
struct Route {
    node: NodeId,
    worker: WorkerId,
    inbox: Inbox,
}

pub struct MessageBus {
    routes: HashMap<ActorId, Route>,
    transport: Arc<dyn Transport>,
    /// Remote readers still holding each exported payload
    exports: Mutex<HashMap<MemoryToken, usize>>,
    messages_sent: AtomicU64,
    cross_node_sends: AtomicU64,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("routes", &self.routes.len())
            .field("exports", &self.exports.lock().len())
            .field("messages_sent", &self.messages_sent.load(Ordering::Relaxed))
            .finish()
    }
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            routes: HashMap::new(),
            transport,
            exports: Mutex::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            cross_node_sends: AtomicU64::new(0),
        }
    }

    /// Bind `actor` to a node and to the inbox of its worker thread
    pub fn add_route(&mut self, actor: ActorId, node: NodeId, worker: WorkerId, inbox: Inbox) {
        self.routes.insert(actor, Route { node, worker, inbox });
    }

    pub fn node_of(&self, actor: ActorId) -> Option<NodeId> {
        self.routes.get(&actor).map(|r| r.node)
    }

    pub fn worker_of(&self, actor: ActorId) -> Option<WorkerId> {
        self.routes.get(&actor).map(|r| r.worker)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn cross_node_sends(&self) -> u64 {
        self.cross_node_sends.load(Ordering::Relaxed)
    }

    /// Payloads currently exported to remote readers
    pub fn exported(&self) -> usize {
        self.exports.lock().len()
    }

    pub fn send(&self, msg: ActorMessage) -> Result<()> {
        let route = self
            .routes
            .get(&msg.dst)
            .ok_or(ActorError::UnknownDestination { actor: msg.dst })?;

        // Senders without a route (the controller) count as local
        let crosses_nodes = self
            .routes
            .get(&msg.src)
            .is_some_and(|src| src.node != route.node);

        let msg = if crosses_nodes {
            self.cross_node_sends.fetch_add(1, Ordering::Relaxed);
            self.prepare_remote(msg, route.node)?
        } else {
            msg
        };

        trace!(message = %msg, worker = %route.worker, "Delivering");
        let dst = msg.dst;
        route
            .inbox
            .send(Envelope::Message(msg))
            .map_err(|_| ActorError::InboxClosed { actor: dst })?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn prepare_remote(&self, msg: ActorMessage, dst_node: NodeId) -> Result<ActorMessage> {
        let ActorMessage { src, dst, kind } = msg;
        let kind = match kind {
            MessageKind::Produced(handle) => {
                let token = handle.token();
                let (remote, payload) = handle.detach_payload();
                if let Some(payload) = payload {
                    self.export(token, payload).map_err(|source| ActorError::Transfer {
                        node: token.node,
                        actor: src,
                        register: token.register,
                        piece: remote.piece(),
                        source,
                    })?;
                }
                MessageKind::Produced(remote)
            }
            MessageKind::Returned(register) => {
                let token = MemoryToken::new(dst_node, register.id, register.generation);
                self.withdraw(&token);
                MessageKind::Returned(register)
            }
            other => other,
        };
        Ok(ActorMessage { src, dst, kind })
    }

    fn export(&self, token: MemoryToken, payload: bytes::Bytes) -> network::Result<()> {
        let mut exports = self.exports.lock();
        if let Some(readers) = exports.get_mut(&token) {
            *readers += 1;
            return Ok(());
        }
        self.transport.register_memory(token, payload)?;
        exports.insert(token, 1);
        debug!(token = %token, "Exported register payload");
        Ok(())
    }

    fn withdraw(&self, token: &MemoryToken) {
        let mut exports = self.exports.lock();
        let Some(readers) = exports.get_mut(token) else {
            warn!(token = %token, "Returned register was never exported");
            return;
        };
        *readers -= 1;
        if *readers > 0 {
            return;
        }
        exports.remove(token);
        if let Err(e) = self.transport.unregister_memory(token) {
            warn!(token = %token, error = %e, "Failed to withdraw exported payload");
        }
    }

    /// Withdraw every export still outstanding, used at teardown
    pub fn release_exports(&self) -> usize {
        let mut exports = self.exports.lock();
        let released = exports.len();
        for (token, _) in exports.drain() {
            if let Err(e) = self.transport.unregister_memory(&token) {
                warn!(token = %token, error = %e, "Failed to withdraw exported payload");
            }
        }
        released
    }
}

impl CompletionNotifier for MessageBus {
    fn notify(&self, event: TransferEvent) {
        let transfer = event.id;
        let requester = event.requester;
        if let Err(e) = self.send(ActorMessage::from_transfer_event(event)) {
            warn!(transfer = %transfer, actor_id = %requester, error = %e, "Dropped transfer event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterPool;
    use crate::test_utils::ManualTransport;
    use types::{PieceId, PortId};

    fn bus_with(
        transport: Arc<ManualTransport>,
    ) -> (MessageBus, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus = MessageBus::new(transport);
        bus.add_route(ActorId(1), NodeId(0), WorkerId(0), tx.clone());
        bus.add_route(ActorId(2), NodeId(1), WorkerId(0), tx.clone());
        bus.add_route(ActorId(3), NodeId(0), WorkerId(0), tx);
        (bus, rx)
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> ActorMessage {
        match rx.try_recv().unwrap() {
            Envelope::Message(msg) => msg,
            Envelope::Stop => panic!("unexpected stop"),
        }
    }

    #[test]
    fn test_unknown_destination() {
        let (bus, _rx) = bus_with(Arc::new(ManualTransport::new()));
        let err = bus
            .send(ActorMessage::end_of_stream(ActorId(1), ActorId(9), PortId(0)))
            .unwrap_err();
        assert!(matches!(err, ActorError::UnknownDestination { .. }));
    }

    #[test]
    fn test_cross_node_produced_is_exported_and_stripped() {
        let transport = Arc::new(ManualTransport::new());
        let (bus, mut rx) = bus_with(transport.clone());
        let mut pool = RegisterPool::new(
            ActorId(1),
            NodeId(0),
            PortId(0),
            1,
            8,
            vec![ActorId(2), ActorId(3)],
        );
        let slot = pool.acquire(PieceId(0)).unwrap();
        pool.buffer_mut(slot).unwrap().extend_from_slice(b"data");
        let handle = pool.publish(slot).unwrap();

        bus.send(ActorMessage::produced(ActorId(1), ActorId(2), handle.clone()))
            .unwrap();
        bus.send(ActorMessage::produced(ActorId(1), ActorId(3), handle.clone()))
            .unwrap();

        match next(&mut rx).kind {
            MessageKind::Produced(remote) => assert!(remote.is_remote()),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut rx).kind {
            MessageKind::Produced(local) => assert!(!local.is_remote()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.registered(), 1);
        assert_eq!(bus.cross_node_sends(), 1);

        bus.send(ActorMessage::returned(ActorId(2), ActorId(1), handle.to_ref()))
            .unwrap();
        assert_eq!(transport.registered(), 0);
        assert_eq!(bus.exported(), 0);
    }

    #[test]
    fn test_per_sender_order() {
        let (bus, mut rx) = bus_with(Arc::new(ManualTransport::new()));
        for port in 0..10 {
            bus.send(ActorMessage::end_of_stream(ActorId(1), ActorId(3), PortId(port)))
                .unwrap();
        }
        for port in 0..10 {
            match next(&mut rx).kind {
                MessageKind::EndOfStream { port: seen } => assert_eq!(seen, PortId(port)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_closed_inbox() {
        let (bus, rx) = bus_with(Arc::new(ManualTransport::new()));
        drop(rx);
        assert!(matches!(
            bus.send(ActorMessage::end_of_stream(ActorId(1), ActorId(3), PortId(0))),
            Err(ActorError::InboxClosed { .. })
        ));
    }
}
