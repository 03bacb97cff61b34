//! Shared actor state
//!
//! `ActorCore` holds what every actor variant has: per-input queues of
//! received handles, per-output register pools, the lifecycle state and the
//! fire / finalize logic. Variants decide when to fire; the core enforces
//! the message protocol.

use crate::context::ExecutionContext;
use crate::error::{ActorError, KernelError, Result};
use crate::kernel::Kernel;
use crate::messages::ActorMessage;
use crate::metrics::ActorMetrics;
use crate::register::{RegisterHandle, RegisterPool, RegisterRef, ReturnProgress};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace};
use types::{ActorId, ActorKind, NodeId, PieceId, PortId, TaskDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Ready,
    Running,
    /// Absorbing; every later message is a protocol violation
    Terminal,
}

/// Result of evaluating the firing predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    /// Inputs are there but an output pool is exhausted
    Stalled,
    NotReady,
}

#[derive(Debug)]
pub(crate) struct InputPort {
    pub(crate) id: PortId,
    pub(crate) producer: ActorId,
    pub(crate) producer_port: PortId,
    pub(crate) queue: VecDeque<RegisterHandle>,
    last_piece: Option<PieceId>,
    pub(crate) closed: bool,
}

impl InputPort {
    pub(crate) fn is_drained(&self) -> bool {
        self.closed && self.queue.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct OutputPort {
    pub(crate) pool: RegisterPool,
    eos_sent: bool,
}

#[derive(Debug)]
pub struct ActorCore {
    pub(crate) id: ActorId,
    pub(crate) node: NodeId,
    pub(crate) kind: ActorKind,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) state: ActorState,
    next_piece: PieceId,
    max_pieces: Option<u64>,
    started: bool,
    stalled: bool,
    pub(crate) metrics: Arc<ActorMetrics>,
}

impl ActorCore {
    /// Bind ports and allocate one register pool per output port
    pub fn new(task: &TaskDescriptor, default_depth: usize) -> Result<Self> {
        task.validate(default_depth)?;

        let inputs = task
            .inputs
            .iter()
            .map(|p| InputPort {
                id: p.id,
                producer: p.producer,
                producer_port: p.producer_port,
                queue: VecDeque::new(),
                last_piece: None,
                closed: false,
            })
            .collect();

        let outputs = task
            .outputs
            .iter()
            .map(|p| OutputPort {
                pool: RegisterPool::new(
                    task.id,
                    task.node,
                    p.id,
                    task.effective_depth(p, default_depth),
                    p.register_bytes,
                    p.consumers.clone(),
                ),
                eos_sent: false,
            })
            .collect();

        debug!(
            actor_id = %task.id,
            node = %task.node,
            kind = ?task.kind,
            inputs = task.inputs.len(),
            outputs = task.outputs.len(),
            "Actor initialised"
        );

        Ok(Self {
            id: task.id,
            node: task.node,
            kind: task.kind,
            inputs,
            outputs,
            state: ActorState::Ready,
            next_piece: PieceId::ZERO,
            max_pieces: task.max_pieces,
            started: false,
            stalled: false,
            metrics: Arc::new(ActorMetrics::default()),
        })
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub(crate) fn protocol(&self, message: impl Into<String>) -> ActorError {
        ActorError::protocol(self.id, message)
    }

    /// Registers InFlight on `port`
    pub fn in_flight(&self, port: PortId) -> Option<usize> {
        self.outputs
            .iter()
            .find(|o| o.pool.port() == port)
            .map(|o| o.pool.in_flight())
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if !self.is_source() {
            return Err(self.protocol("Start sent to an actor with inputs"));
        }
        if self.started {
            return Err(self.protocol("Start received twice"));
        }
        self.started = true;
        self.state = ActorState::Running;
        info!(actor_id = %self.id, max_pieces = ?self.max_pieces, "Source started");
        Ok(())
    }

    /// Queue a produced register on the input fed by its producer port
    pub(crate) fn accept_produced(&mut self, src: ActorId, handle: RegisterHandle) -> Result<usize> {
        let producer_port = handle.id().port;
        if handle.id().producer != src {
            return Err(self.protocol(format!(
                "{src} sent Produced for {} it does not own",
                handle.id()
            )));
        }
        let index = self
            .inputs
            .iter()
            .position(|i| i.producer == src && i.producer_port == producer_port)
            .ok_or_else(|| {
                self.protocol(format!("no input is fed by {src} {producer_port}"))
            })?;

        let id = self.id;
        let input = &mut self.inputs[index];
        if input.closed {
            return Err(ActorError::protocol(
                id,
                format!("Produced {} on {} after EndOfStream", handle.piece(), input.id),
            ));
        }
        if input.last_piece.is_some_and(|last| handle.piece() <= last) {
            return Err(ActorError::protocol(
                id,
                format!(
                    "duplicate or regressing {} on {} (last {:?})",
                    handle.piece(),
                    input.id,
                    input.last_piece
                ),
            ));
        }

        trace!(
            actor_id = %id,
            port = %input.id,
            register = %handle.id(),
            piece = %handle.piece(),
            "Queued input register"
        );
        input.last_piece = Some(handle.piece());
        input.queue.push_back(handle);
        if self.state == ActorState::Ready {
            self.state = ActorState::Running;
        }
        Ok(index)
    }

    pub(crate) fn accept_returned(
        &mut self,
        src: ActorId,
        register: RegisterRef,
    ) -> Result<ReturnProgress> {
        if register.id.producer != self.id {
            return Err(self.protocol(format!("Returned for foreign {}", register.id)));
        }
        let id = self.id;
        let output = self
            .outputs
            .iter_mut()
            .find(|o| o.pool.port() == register.id.port)
            .ok_or_else(|| ActorError::protocol(id, format!("Returned on unknown {}", register.id.port)))?;

        let progress = output
            .pool
            .on_returned(src, register)
            .map_err(|violation| ActorError::protocol(id, violation.to_string()))?;
        self.metrics.record_returned();
        trace!(
            actor_id = %id,
            register = %register.id,
            piece = %register.piece,
            progress = ?progress,
            "Register returned"
        );
        Ok(progress)
    }

    pub(crate) fn accept_end_of_stream(&mut self, src: ActorId, port: PortId) -> Result<()> {
        let id = self.id;
        let input = self
            .inputs
            .iter_mut()
            .find(|i| i.producer == src && i.producer_port == port)
            .ok_or_else(|| ActorError::protocol(id, format!("EndOfStream from unconnected {src} {port}")))?;
        if input.closed {
            return Err(ActorError::protocol(
                id,
                format!("duplicate EndOfStream on {}", input.id),
            ));
        }
        input.closed = true;
        debug!(actor_id = %id, port = %input.id, queued = input.queue.len(), "Input closed");
        Ok(())
    }

    fn source_exhausted(&self) -> bool {
        self.max_pieces
            .is_some_and(|max| self.next_piece.get() >= max)
    }

    pub(crate) fn outputs_free(&self) -> bool {
        self.outputs.iter().all(|o| o.pool.has_free())
    }

    pub(crate) fn readiness(&self) -> Readiness {
        let inputs_ready = if self.is_source() {
            self.started && !self.source_exhausted()
        } else {
            self.inputs.iter().all(|i| !i.queue.is_empty())
        };
        if !inputs_ready {
            Readiness::NotReady
        } else if self.outputs_free() {
            Readiness::Ready
        } else {
            Readiness::Stalled
        }
    }

    /// Record a stall once per blocked period
    pub(crate) fn note_stall(&mut self) {
        if !self.stalled {
            self.stalled = true;
            self.metrics.record_stall();
            debug!(actor_id = %self.id, "Output pool exhausted, stalling");
        }
    }

    pub(crate) fn clear_stall(&mut self) {
        self.stalled = false;
    }

    /// Fire while the predicate holds, then finalize if the stream ended
    pub(crate) fn pump(&mut self, kernel: &mut dyn Kernel, ctx: &mut dyn ExecutionContext) -> Result<()> {
        loop {
            match self.readiness() {
                Readiness::Ready => self.fire(kernel, ctx)?,
                Readiness::Stalled => {
                    self.note_stall();
                    break;
                }
                Readiness::NotReady => break,
            }
        }

        if self.stream_finished() {
            self.finalize(ctx)?;
        }
        Ok(())
    }

    /// One fire: dequeue one register per input, acquire one per output,
    /// run the kernel, publish downstream and return the inputs upstream
    fn fire(&mut self, kernel: &mut dyn Kernel, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let piece = self.next_piece;
        let mut slots = Vec::with_capacity(self.outputs.len());
        for output in &mut self.outputs {
            let Some(slot) = output.pool.acquire(piece) else {
                return Err(ActorError::protocol(
                    self.id,
                    format!("fired with {} exhausted", output.pool.port()),
                ));
            };
            slots.push(slot);
        }

        let inputs: Vec<RegisterHandle> = self
            .inputs
            .iter_mut()
            .filter_map(|i| i.queue.pop_front())
            .collect();

        let mut buffers: Vec<BytesMut> = self
            .outputs
            .iter_mut()
            .zip(&slots)
            .map(|(o, slot)| o.pool.lend_buffer(*slot).unwrap_or_default())
            .collect();

        let executed = kernel.execute(piece, &inputs, &mut buffers).and_then(|()| {
            for (output, buffer) in self.outputs.iter().zip(&buffers) {
                if buffer.len() > output.pool.register_bytes() {
                    return Err(KernelError::new(format!(
                        "{} bytes written to {} sized {}",
                        buffer.len(),
                        output.pool.port(),
                        output.pool.register_bytes()
                    )));
                }
            }
            Ok(())
        });

        if let Err(e) = executed {
            for (output, slot) in self.outputs.iter_mut().zip(&slots) {
                output.pool.abandon(*slot);
            }
            return Err(ActorError::kernel(self.id, e));
        }

        let mut produced = 0u64;
        for ((output, slot), buffer) in self.outputs.iter_mut().zip(&slots).zip(buffers) {
            output.pool.restore_buffer(*slot, buffer);
            let handle = output
                .pool
                .publish(*slot)
                .ok_or_else(|| ActorError::protocol(self.id, "acquired register could not be published"))?;
            for consumer in output.pool.consumers() {
                ctx.send(ActorMessage::produced(self.id, *consumer, handle.clone()))?;
                produced += 1;
            }
        }

        let returns: Vec<RegisterRef> = inputs.iter().map(RegisterHandle::to_ref).collect();
        drop(inputs);
        for register in returns {
            ctx.send(ActorMessage::returned(self.id, register.id.producer, register))?;
        }

        self.next_piece = piece.next();
        self.state = ActorState::Running;
        self.clear_stall();
        self.metrics.record_fire();
        self.metrics.record_produced(produced);
        debug!(actor_id = %self.id, piece = %piece, "Fired");
        Ok(())
    }

    /// No fire can ever happen again
    fn stream_finished(&self) -> bool {
        if self.is_source() {
            return self.started && self.source_exhausted();
        }
        self.inputs.iter().all(|i| i.closed) && self.inputs.iter().any(|i| i.queue.is_empty())
    }

    /// Return leftover inputs, emit EndOfStream on every output once, and
    /// enter Terminal when nothing is left in flight
    pub(crate) fn finalize(&mut self, ctx: &mut dyn ExecutionContext) -> Result<()> {
        for input in &mut self.inputs {
            while let Some(handle) = input.queue.pop_front() {
                debug!(
                    actor_id = %self.id,
                    port = %input.id,
                    piece = %handle.piece(),
                    "Returning input that can never fire"
                );
                let register = handle.to_ref();
                drop(handle);
                ctx.send(ActorMessage::returned(self.id, input.producer, register))?;
            }
        }

        for output in &mut self.outputs {
            if output.eos_sent {
                continue;
            }
            for consumer in output.pool.consumers() {
                ctx.send(ActorMessage::end_of_stream(self.id, *consumer, output.pool.port()))?;
            }
            output.eos_sent = true;
            debug!(actor_id = %self.id, port = %output.pool.port(), "EndOfStream emitted");
        }

        self.check_terminal();
        Ok(())
    }

    /// Terminal once EndOfStream went out everywhere and every register
    /// came back
    pub(crate) fn check_terminal(&mut self) {
        if self.state == ActorState::Terminal {
            return;
        }
        let inputs_done = self.inputs.iter().all(|i| i.is_drained());
        let outputs_done = self
            .outputs
            .iter()
            .all(|o| o.eos_sent && o.pool.in_flight() == 0);
        let ended = if self.is_source() {
            self.started && self.source_exhausted()
        } else {
            inputs_done
        };
        if ended && outputs_done {
            self.state = ActorState::Terminal;
            info!(actor_id = %self.id, pieces = self.next_piece.get(), "Actor terminal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CounterSource, Identity};
    use crate::messages::MessageKind;
    use crate::test_utils::{RecordingContext, TaskBuilder};

    #[test]
    fn test_zero_depth_is_descriptor_error() {
        let task = TaskBuilder::source(1, 4).output(0, &[2], 8).depth(0).build();
        assert!(matches!(
            ActorCore::new(&task, 2),
            Err(ActorError::Descriptor(_))
        ));
    }

    #[test]
    fn test_source_fires_up_to_depth_then_stalls() {
        let task = TaskBuilder::source(1, 4).output(0, &[2], 8).depth(2).build();
        let mut core = ActorCore::new(&task, 2).unwrap();
        let mut ctx = RecordingContext::new();
        core.start().unwrap();
        core.pump(&mut CounterSource, &mut ctx).unwrap();

        assert_eq!(ctx.produced().len(), 2);
        assert_eq!(core.in_flight(PortId(0)), Some(2));
        assert_eq!(core.metrics.snapshot().stalls, 1);
        assert_eq!(core.state(), ActorState::Running);
    }

    #[test]
    fn test_produced_after_eos_is_protocol_error() {
        let task = TaskBuilder::compute(2, "identity").input(0, 1, 0).build();
        let mut core = ActorCore::new(&task, 2).unwrap();
        core.accept_end_of_stream(ActorId(1), PortId(0)).unwrap();

        let handle = TaskBuilder::handle(1, 0, 0, b"x");
        assert!(matches!(
            core.accept_produced(ActorId(1), handle),
            Err(ActorError::Protocol { .. })
        ));
        assert!(core.accept_end_of_stream(ActorId(1), PortId(0)).is_err());
    }

    #[test]
    fn test_duplicate_piece_is_protocol_error() {
        let task = TaskBuilder::compute(2, "identity").input(0, 1, 0).build();
        let mut core = ActorCore::new(&task, 2).unwrap();
        core.accept_produced(ActorId(1), TaskBuilder::handle(1, 0, 3, b"a"))
            .unwrap();
        assert!(core
            .accept_produced(ActorId(1), TaskBuilder::handle(1, 0, 3, b"a"))
            .is_err());
    }

    #[test]
    fn test_foreign_return_is_protocol_error() {
        let task = TaskBuilder::source(1, 1).output(0, &[2], 8).build();
        let mut core = ActorCore::new(&task, 2).unwrap();
        let foreign = TaskBuilder::handle(7, 0, 0, b"").to_ref();
        assert!(core.accept_returned(ActorId(2), foreign).is_err());
    }

    #[test]
    fn test_terminal_after_outputs_returned() {
        let task = TaskBuilder::compute(2, "identity")
            .input(0, 1, 0)
            .output(1, &[3], 8)
            .build();
        let mut core = ActorCore::new(&task, 2).unwrap();
        let mut ctx = RecordingContext::new();

        core.accept_produced(ActorId(1), TaskBuilder::handle(1, 0, 0, b"v"))
            .unwrap();
        core.accept_end_of_stream(ActorId(1), PortId(0)).unwrap();
        core.pump(&mut Identity, &mut ctx).unwrap();

        // Fired once, returned the input, emitted EOS; still waiting on the
        // output register
        assert_eq!(ctx.produced().len(), 1);
        assert_eq!(ctx.returned().len(), 1);
        assert_eq!(ctx.end_of_streams().len(), 1);
        assert_eq!(core.state(), ActorState::Running);

        let handle = match &ctx.produced()[0].kind {
            MessageKind::Produced(handle) => handle.to_ref(),
            _ => unreachable!(),
        };
        core.accept_returned(ActorId(3), handle).unwrap();
        core.check_terminal();
        assert_eq!(core.state(), ActorState::Terminal);
    }
}
