//! Execution Context
//!
//! Passed to `Actor::process_message`. It names the worker thread running
//! the call and is the only way an actor emits messages; it holds no
//! mutable state shared with other actors.

use crate::bus::MessageBus;
use crate::error::Result;
use crate::messages::ActorMessage;
use network::CompletionNotifier;
use std::sync::Arc;
use types::WorkerId;

pub trait ExecutionContext {
    /// Worker thread the actor is bound to
    fn worker(&self) -> WorkerId;

    /// Hand a message to the bus
    fn send(&mut self, msg: ActorMessage) -> Result<()>;

    /// Sink for transport events that routes them back to the requesting
    /// actor's inbox
    fn notifier(&self) -> Arc<dyn CompletionNotifier>;
}

/// Context used by worker threads of the `ActorSystem`
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker: WorkerId,
    bus: Arc<MessageBus>,
}

impl WorkerContext {
    pub fn new(worker: WorkerId, bus: Arc<MessageBus>) -> Self {
        Self { worker, bus }
    }
}

impl ExecutionContext for WorkerContext {
    fn worker(&self) -> WorkerId {
        self.worker
    }

    fn send(&mut self, msg: ActorMessage) -> Result<()> {
        self.bus.send(msg)
    }

    fn notifier(&self) -> Arc<dyn CompletionNotifier> {
        self.bus.clone()
    }
}
