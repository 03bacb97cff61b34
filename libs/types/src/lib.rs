//! # Dataflow Runtime Types
//!
//! Shared identifiers and task descriptors for the actor-based dataflow
//! runtime.
//!
//! ## Contents
//!
//! - **Identifiers**: `ActorId`, `NodeId`, `PortId`, `PieceId`, `RegisterId`,
//!   `WorkerId`, `TransferId`
//! - **Descriptors**: `TaskDescriptor` and its port descriptors, as emitted
//!   by graph compilation and consumed by an actor's `init`
//!
//! ```rust
//! use types::{ActorId, PortId, RegisterId};
//!
//! let regst = RegisterId::new(ActorId(3), PortId(0), 1);
//! assert_eq!(regst.to_string(), "regst-3/0/1");
//! ```

pub mod descriptor;
pub mod ids;

pub use descriptor::{
    validate_graph, ActorKind, DescriptorError, InputPortDescriptor, OutputPortDescriptor,
    TaskDescriptor,
};
pub use ids::{ActorId, NodeId, PieceId, PortId, RegisterId, TransferId, WorkerId};
