//! Task Descriptors
//!
//! The per-actor task description produced by graph compilation. An actor is
//! created from exactly one descriptor at launch time; `validate` rejects
//! anything the actor could not run with, and `validate_graph` checks that
//! producer and consumer sides of every edge agree.

use crate::ids::{ActorId, NodeId, PortId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Actor variant selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// Runs a kernel over its inputs to fill its outputs
    #[default]
    Compute,
    /// Copies a (possibly remote) producer's register into a local one
    NetworkCopy,
}

/// Inbound edge: which producer port feeds this input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPortDescriptor {
    pub id: PortId,
    pub producer: ActorId,
    pub producer_port: PortId,
}

/// Outbound edge: register shape and the actors reading it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPortDescriptor {
    pub id: PortId,
    pub consumers: Vec<ActorId>,
    /// Size of each register buffer in this port's pool
    pub register_bytes: usize,
    /// Overrides the task-level pipeline depth for this port
    #[serde(default)]
    pub pipeline_depth: Option<usize>,
}

/// Everything an actor needs at `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: ActorId,
    #[serde(default)]
    pub node: NodeId,
    #[serde(default)]
    pub kind: ActorKind,
    /// Name of the kernel the launcher resolves for compute actors
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputPortDescriptor>,
    #[serde(default)]
    pub outputs: Vec<OutputPortDescriptor>,
    #[serde(default)]
    pub pipeline_depth: Option<usize>,
    /// Number of pieces a source actor emits before EndOfStream
    #[serde(default)]
    pub max_pieces: Option<u64>,
}

/// Malformed task descriptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("{actor}: pipeline depth of {port} is zero")]
    ZeroPipelineDepth { actor: ActorId, port: PortId },

    #[error("{actor}: {port} declared more than once")]
    DuplicatePort { actor: ActorId, port: PortId },

    #[error("{actor}: unknown port {port}")]
    UnknownPort { actor: ActorId, port: PortId },

    #[error("{actor}: unknown actor {referenced} referenced by {port}")]
    UnknownActor {
        actor: ActorId,
        port: PortId,
        referenced: ActorId,
    },

    #[error("{actor}: duplicate task id")]
    DuplicateTask { actor: ActorId },

    #[error("{actor}: output {port} has no consumers")]
    NoConsumers { actor: ActorId, port: PortId },

    #[error("{actor}: output {port} has zero-sized registers")]
    EmptyRegister { actor: ActorId, port: PortId },

    #[error("{actor}: edge mismatch on {port}: {reason}")]
    EdgeMismatch {
        actor: ActorId,
        port: PortId,
        reason: String,
    },

    #[error("{actor}: invalid shape for {kind:?} actor: {reason}")]
    InvalidShape {
        actor: ActorId,
        kind: ActorKind,
        reason: String,
    },
}

impl TaskDescriptor {
    /// Source actors have no inputs and fire on their own
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn input(&self, port: PortId) -> Option<&InputPortDescriptor> {
        self.inputs.iter().find(|p| p.id == port)
    }

    pub fn output(&self, port: PortId) -> Option<&OutputPortDescriptor> {
        self.outputs.iter().find(|p| p.id == port)
    }

    /// Input port fed by `producer`'s `producer_port`
    pub fn input_fed_by(&self, producer: ActorId, producer_port: PortId) -> Option<PortId> {
        self.inputs
            .iter()
            .find(|p| p.producer == producer && p.producer_port == producer_port)
            .map(|p| p.id)
    }

    /// Pipeline depth of an output port, falling back to the task and then
    /// to the runtime default
    pub fn effective_depth(&self, port: &OutputPortDescriptor, default_depth: usize) -> usize {
        port.pipeline_depth
            .or(self.pipeline_depth)
            .unwrap_or(default_depth)
    }

    /// Check the descriptor on its own
    pub fn validate(&self, default_depth: usize) -> Result<(), DescriptorError> {
        let mut seen = HashSet::new();
        for port in self
            .inputs
            .iter()
            .map(|p| p.id)
            .chain(self.outputs.iter().map(|p| p.id))
        {
            if !seen.insert(port) {
                return Err(DescriptorError::DuplicatePort {
                    actor: self.id,
                    port,
                });
            }
        }

        for output in &self.outputs {
            if self.effective_depth(output, default_depth) == 0 {
                return Err(DescriptorError::ZeroPipelineDepth {
                    actor: self.id,
                    port: output.id,
                });
            }
            if output.consumers.is_empty() {
                return Err(DescriptorError::NoConsumers {
                    actor: self.id,
                    port: output.id,
                });
            }
            if output.register_bytes == 0 {
                return Err(DescriptorError::EmptyRegister {
                    actor: self.id,
                    port: output.id,
                });
            }
        }

        match self.kind {
            ActorKind::NetworkCopy => {
                if self.inputs.len() != 1 || self.outputs.len() != 1 {
                    return Err(self.shape_error("requires exactly one input and one output port"));
                }
                if self.max_pieces.is_some() {
                    return Err(self.shape_error("max_pieces is only meaningful for sources"));
                }
            }
            ActorKind::Compute => {
                if self.inputs.is_empty() && self.outputs.is_empty() {
                    return Err(self.shape_error("has neither inputs nor outputs"));
                }
                if self.is_source() && self.max_pieces.is_none() {
                    return Err(self.shape_error("source actors require max_pieces"));
                }
                if !self.is_source() && self.max_pieces.is_some() {
                    return Err(self.shape_error("max_pieces is only meaningful for sources"));
                }
            }
        }

        Ok(())
    }

    fn shape_error(&self, reason: &str) -> DescriptorError {
        DescriptorError::InvalidShape {
            actor: self.id,
            kind: self.kind,
            reason: reason.to_string(),
        }
    }
}

/// Validate every descriptor and cross-check both ends of each edge
pub fn validate_graph(
    tasks: &[TaskDescriptor],
    default_depth: usize,
) -> Result<(), DescriptorError> {
    let mut by_id: HashMap<ActorId, &TaskDescriptor> = HashMap::with_capacity(tasks.len());
    for task in tasks {
        task.validate(default_depth)?;
        if by_id.insert(task.id, task).is_some() {
            return Err(DescriptorError::DuplicateTask { actor: task.id });
        }
    }

    for task in tasks {
        for input in &task.inputs {
            let producer = by_id
                .get(&input.producer)
                .ok_or(DescriptorError::UnknownActor {
                    actor: task.id,
                    port: input.id,
                    referenced: input.producer,
                })?;
            let output = producer
                .output(input.producer_port)
                .ok_or(DescriptorError::UnknownPort {
                    actor: producer.id,
                    port: input.producer_port,
                })?;
            if !output.consumers.contains(&task.id) {
                return Err(DescriptorError::EdgeMismatch {
                    actor: task.id,
                    port: input.id,
                    reason: format!(
                        "{} {} does not list this actor as a consumer",
                        producer.id, output.id
                    ),
                });
            }
            if task.kind == ActorKind::Compute && producer.node != task.node {
                return Err(DescriptorError::EdgeMismatch {
                    actor: task.id,
                    port: input.id,
                    reason: format!(
                        "{} on {} feeds a compute actor on {} without a network copy",
                        producer.id, producer.node, task.node
                    ),
                });
            }
        }
    }

    for task in tasks {
        for output in &task.outputs {
            for consumer_id in &output.consumers {
                let consumer = by_id
                    .get(consumer_id)
                    .ok_or(DescriptorError::UnknownActor {
                        actor: task.id,
                        port: output.id,
                        referenced: *consumer_id,
                    })?;
                if consumer.input_fed_by(task.id, output.id).is_none() {
                    return Err(DescriptorError::EdgeMismatch {
                        actor: task.id,
                        port: output.id,
                        reason: format!("{} has no input port fed by it", consumer.id),
                    });
                }
            }
        }
    }

    Ok(())
}
