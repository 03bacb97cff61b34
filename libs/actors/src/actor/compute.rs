//! Compute actor: fires its kernel whenever every input has a queued
//! register and every output pool has a free one.

use super::base::ActorCore;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::messages::{ActorCommand, ActorMessage, MessageKind};
use std::fmt;

pub struct ComputeActor {
    pub(crate) core: ActorCore,
    kernel: Box<dyn Kernel>,
}

impl fmt::Debug for ComputeActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeActor").field("core", &self.core).finish()
    }
}

impl ComputeActor {
    pub fn new(core: ActorCore, kernel: Box<dyn Kernel>) -> Self {
        Self { core, kernel }
    }

    pub(crate) fn process(&mut self, msg: ActorMessage, ctx: &mut dyn ExecutionContext) -> Result<()> {
        let ActorMessage { src, kind, .. } = msg;
        match kind {
            MessageKind::Produced(handle) => {
                if handle.is_remote() {
                    return Err(self.core.protocol(format!(
                        "{} from another node reached a compute actor",
                        handle.id()
                    )));
                }
                self.core.accept_produced(src, handle)?;
            }
            MessageKind::Returned(register) => {
                self.core.accept_returned(src, register)?;
            }
            MessageKind::EndOfStream { port } => {
                self.core.accept_end_of_stream(src, port)?;
            }
            MessageKind::Command(ActorCommand::Start) => self.core.start()?,
            other => {
                return Err(self
                    .core
                    .protocol(format!("unexpected {} message", other.name())));
            }
        }

        self.core.pump(self.kernel.as_mut(), ctx)?;
        self.core.check_terminal();
        Ok(())
    }
}
