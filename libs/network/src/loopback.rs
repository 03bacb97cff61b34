//! Loopback Transport
//!
//! In-process transport that simulates cross-node copies. Registered
//! payloads live in a concurrent map keyed by `MemoryToken`; each accepted
//! transfer runs as a tokio task that optionally sleeps for the configured
//! latency plus random jitter, copies the bytes into the destination buffer
//! and notifies the requester.
//!
//! Because every transfer sleeps independently, completions routinely
//! arrive out of issue order when jitter is non-zero. Consumers of this
//! transport must not assume FIFO completion.

use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::transfer::{
    fill_destination, CompletionNotifier, MemoryToken, Transport, TransferEvent, TransferRequest,
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};
use types::TransferId;

/// Simulation knobs
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    /// Fixed delay applied to every transfer
    pub latency: Duration,
    /// Upper bound of the uniformly distributed extra delay
    pub jitter: Duration,
    /// Probability in [0, 1] that a transfer fails
    pub failure_rate: f64,
    /// Seed for jitter and fault decisions
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failure_rate: 0.0,
            seed: 0,
        }
    }
}

impl LoopbackConfig {
    /// Reordering-heavy configuration used by stress tests
    pub fn jittery(seed: u64) -> Self {
        Self {
            latency: Duration::from_micros(50),
            jitter: Duration::from_millis(2),
            failure_rate: 0.0,
            seed,
        }
    }
}

/// Transport backed by process memory and tokio tasks
pub struct LoopbackTransport {
    memory: DashMap<MemoryToken, Bytes>,
    runtime: Handle,
    config: LoopbackConfig,
    rng: Mutex<StdRng>,
    metrics: Arc<TransportMetrics>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("registered", &self.memory.len())
            .field("config", &self.config)
            .finish()
    }
}

impl LoopbackTransport {
    pub fn new(runtime: Handle, config: LoopbackConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            memory: DashMap::new(),
            runtime,
            config,
            rng: Mutex::new(rng),
            metrics: Arc::new(TransportMetrics::default()),
        }
    }

    /// Number of payloads currently exposed
    pub fn registered_regions(&self) -> usize {
        self.memory.len()
    }

    fn draw(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock();
        let jitter_ns = self.config.jitter.as_nanos() as u64;
        let extra = if jitter_ns == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_ns)
        };
        let fail = self.config.failure_rate > 0.0
            && rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0));
        (self.config.latency + Duration::from_nanos(extra), fail)
    }
}

impl Transport for LoopbackTransport {
    fn register_memory(&self, token: MemoryToken, payload: Bytes) -> Result<()> {
        if self.memory.contains_key(&token) {
            return Err(TransportError::AlreadyRegistered { token });
        }
        trace!(token = %token, bytes = payload.len(), "Registering memory");
        self.memory.insert(token, payload);
        self.metrics.record_registered();
        Ok(())
    }

    fn unregister_memory(&self, token: &MemoryToken) -> Result<Bytes> {
        let (_, payload) = self
            .memory
            .remove(token)
            .ok_or(TransportError::UnknownMemory { token: *token })?;
        trace!(token = %token, "Unregistered memory");
        self.metrics.record_unregistered();
        Ok(payload)
    }

    fn begin_transfer(
        &self,
        request: TransferRequest,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Result<TransferId> {
        let token = request.source;
        let source = match self.memory.get(&token) {
            Some(entry) => entry.value().clone(),
            None => {
                self.metrics.record_rejected();
                return Err(TransportError::UnknownMemory { token });
            }
        };

        let capacity = request.dest.capacity().max(request.dest.len());
        if source.len() > capacity {
            self.metrics.record_rejected();
            return Err(TransportError::SizeMismatch {
                token,
                source_len: source.len(),
                capacity,
            });
        }

        let id = request.id;
        let (delay, fail) = self.draw();
        let metrics = Arc::clone(&self.metrics);
        metrics.record_started();

        debug!(
            transfer = %id,
            requester = %request.requester,
            source = %token,
            piece = %request.piece,
            delay_us = delay.as_micros() as u64,
            "Transfer issued"
        );

        self.runtime.spawn(async move {
            let started = Instant::now();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let event = if fail {
                metrics.record_failed();
                warn!(transfer = %id, source = %token, "Injected transfer failure");
                TransferEvent::failed(&request, TransportError::injected("loopback fault injection"))
            } else {
                let mut request = request;
                match fill_destination(token, &source, &mut request.dest) {
                    Ok(()) => {
                        metrics.record_completed(source.len(), started.elapsed());
                        TransferEvent::completed(request)
                    }
                    Err(error) => {
                        metrics.record_failed();
                        TransferEvent::failed(&request, error)
                    }
                }
            };

            notifier.notify(event);
        });

        Ok(id)
    }

    fn metrics(&self) -> Arc<TransportMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferOutcome;
    use bytes::BytesMut;
    use tokio::sync::mpsc;
    use types::{ActorId, NodeId, PieceId, PortId, RegisterId};

    struct ChannelNotifier(mpsc::UnboundedSender<TransferEvent>);

    impl CompletionNotifier for ChannelNotifier {
        fn notify(&self, event: TransferEvent) {
            let _ = self.0.send(event);
        }
    }

    fn token(slot: u32) -> MemoryToken {
        MemoryToken::new(NodeId(1), RegisterId::new(ActorId(1), PortId(0), slot), 0)
    }

    fn request(id: u64, source: MemoryToken, capacity: usize) -> TransferRequest {
        TransferRequest {
            id: TransferId(id),
            requester: ActorId(9),
            source,
            piece: PieceId(id),
            dest: BytesMut::zeroed(capacity),
        }
    }

    fn notifier() -> (Arc<dyn CompletionNotifier>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelNotifier(tx)), rx)
    }

    #[tokio::test]
    async fn test_transfer_copies_payload() {
        let transport = LoopbackTransport::new(Handle::current(), LoopbackConfig::default());
        transport
            .register_memory(token(0), Bytes::from_static(b"hello"))
            .unwrap();

        let (notifier, mut rx) = notifier();
        transport
            .begin_transfer(request(1, token(0), 16), notifier)
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, TransferId(1));
        match event.outcome {
            TransferOutcome::Completed { buffer } => assert_eq!(&buffer[..], b"hello"),
            TransferOutcome::Failed { error } => panic!("unexpected failure: {error}"),
        }
        assert_eq!(transport.metrics().snapshot().bytes_transferred, 5);
    }

    #[tokio::test]
    async fn test_unknown_memory_rejected_synchronously() {
        let transport = LoopbackTransport::new(Handle::current(), LoopbackConfig::default());
        let (notifier, mut rx) = notifier();
        let err = transport
            .begin_transfer(request(1, token(3), 16), notifier)
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownMemory { .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.metrics().snapshot().transfers_rejected, 1);
    }

    #[tokio::test]
    async fn test_destination_too_small_rejected() {
        let transport = LoopbackTransport::new(Handle::current(), LoopbackConfig::default());
        transport
            .register_memory(token(0), Bytes::from(vec![1u8; 32]))
            .unwrap();
        let (notifier, _rx) = notifier();
        let err = transport
            .begin_transfer(request(1, token(0), 8), notifier)
            .unwrap_err();
        assert!(matches!(err, TransportError::SizeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let transport = LoopbackTransport::new(Handle::current(), LoopbackConfig::default());
        transport.register_memory(token(0), Bytes::new()).unwrap();
        assert!(matches!(
            transport.register_memory(token(0), Bytes::new()),
            Err(TransportError::AlreadyRegistered { .. })
        ));
        transport.unregister_memory(&token(0)).unwrap();
        assert_eq!(transport.registered_regions(), 0);
        assert!(transport.unregister_memory(&token(0)).is_err());
    }

    #[tokio::test]
    async fn test_fault_injection_delivers_failure_event() {
        let config = LoopbackConfig {
            failure_rate: 1.0,
            ..LoopbackConfig::default()
        };
        let transport = LoopbackTransport::new(Handle::current(), config);
        transport
            .register_memory(token(0), Bytes::from_static(b"x"))
            .unwrap();
        let (notifier, mut rx) = notifier();
        transport
            .begin_transfer(request(4, token(0), 4), notifier)
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.piece, PieceId(4));
        assert!(matches!(
            event.outcome,
            TransferOutcome::Failed {
                error: TransportError::Injected { .. }
            }
        ));
        assert_eq!(transport.metrics().snapshot().transfers_failed, 1);
    }

    #[tokio::test]
    async fn test_every_accepted_transfer_completes_once() {
        let transport =
            LoopbackTransport::new(Handle::current(), LoopbackConfig::jittery(7));
        for slot in 0..8 {
            transport
                .register_memory(token(slot), Bytes::from(vec![slot as u8; 4]))
                .unwrap();
        }
        let (notifier, mut rx) = notifier();
        for slot in 0..8u32 {
            transport
                .begin_transfer(request(slot as u64, token(slot), 4), Arc::clone(&notifier))
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let event = rx.recv().await.unwrap();
            assert!(event.outcome.is_completed());
            seen.push(event.id.get());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert_eq!(transport.metrics().in_flight(), 0);
    }
}
