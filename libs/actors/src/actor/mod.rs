//! Actors
//!
//! `Actor` is a closed set of variants selected from the task descriptor's
//! `kind` at launch. Both share `ActorCore`; `process_message` is the single
//! entry point and runs on the worker thread the actor is bound to.
//!
//! ```text
//!   Ready ──Produced/Start──> Running ──EOS out + registers back──> Terminal
//! ```

mod base;
mod compute;
mod network_copy;

pub use self::base::{ActorCore, ActorState};
pub use self::compute::ComputeActor;
pub use self::network_copy::NetworkCopyActor;

use crate::context::ExecutionContext;
use crate::error::{ActorError, Result};
use crate::kernel::KernelRegistry;
use crate::messages::ActorMessage;
use crate::metrics::ActorMetrics;
use network::Transport;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use types::{ActorId, ActorKind, NodeId, PortId, TaskDescriptor};

#[derive(Debug)]
pub enum Actor {
    Compute(ComputeActor),
    NetworkCopy(NetworkCopyActor),
}

impl Actor {
    /// Build the variant a descriptor asks for
    pub fn init(
        task: &TaskDescriptor,
        default_depth: usize,
        kernels: &KernelRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let core = ActorCore::new(task, default_depth)?;
        let actor = match task.kind {
            ActorKind::Compute => {
                let kernel = kernels
                    .build(task)
                    .map_err(|e| ActorError::kernel(task.id, e))?;
                Actor::Compute(ComputeActor::new(core, kernel))
            }
            ActorKind::NetworkCopy => Actor::NetworkCopy(NetworkCopyActor::new(core, transport)),
        };
        Ok(actor)
    }

    fn core(&self) -> &ActorCore {
        match self {
            Actor::Compute(a) => &a.core,
            Actor::NetworkCopy(a) => &a.core,
        }
    }

    pub fn id(&self) -> ActorId {
        self.core().id
    }

    pub fn node(&self) -> NodeId {
        self.core().node
    }

    pub fn kind(&self) -> ActorKind {
        self.core().kind
    }

    pub fn state(&self) -> ActorState {
        self.core().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == ActorState::Terminal
    }

    pub fn is_source(&self) -> bool {
        self.core().is_source()
    }

    pub fn metrics(&self) -> Arc<ActorMetrics> {
        Arc::clone(&self.core().metrics)
    }

    /// Registers InFlight on an output port
    pub fn in_flight(&self, port: PortId) -> Option<usize> {
        self.core().in_flight(port)
    }

    /// Handle one message; only called from the actor's worker thread
    pub fn process_message(
        &mut self,
        msg: ActorMessage,
        ctx: &mut dyn ExecutionContext,
    ) -> Result<()> {
        let id = self.id();
        if msg.dst != id {
            return Err(ActorError::protocol(
                id,
                format!("misrouted message: {msg}"),
            ));
        }
        if self.is_terminal() {
            return Err(ActorError::protocol(id, format!("{msg} after Terminal")));
        }

        debug!(actor_id = %id, worker = %ctx.worker(), message = %msg, "Processing");
        let started = Instant::now();
        let result = match self {
            Actor::Compute(a) => a.process(msg, ctx),
            Actor::NetworkCopy(a) => a.process(msg, ctx),
        };
        self.core().metrics.record_message(started.elapsed());

        if let Err(e) = &result {
            if e.is_fatal() {
                error!(actor_id = %id, category = e.category(), error = %e, "Actor failed");
            }
        }
        result
    }
}
