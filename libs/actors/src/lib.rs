//! Dataflow Actor Runtime
//!
//! Actor-based execution of a partitioned computation graph. Each task of
//! the graph is driven by one actor; actors exchange only messages that
//! reference registers, fixed-capacity buffers owned by the producing
//! actor's output port.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ Produced(handle) ┌──────────────────┐ Produced ┌──────────┐
//! │ source actor │ ───────────────> │ NetworkCopyActor │ ───────> │  sink    │
//! │   node 0     │ <─────────────── │     node 1       │ <─────── │  node 1  │
//! └──────────────┘    Returned      └──────────────────┘ Returned └──────────┘
//!                                      │        ^
//!                         begin_transfer│        │TransferComplete
//!                                      v        │ (own inbox)
//!                                   ┌──────────────┐
//!                                   │  Transport   │
//!                                   └──────────────┘
//! ```
//!
//! - **Backpressure**: every output port owns `pipeline_depth` registers. A
//!   producer with no Free register stalls until a Returned arrives.
//! - **Ordering**: the bus preserves per-sender order; the copy actor
//!   releases pieces in order whatever order transfers complete in.
//! - **Threads**: an actor is bound to one worker thread for life and
//!   processes one message at a time, so actor state needs no locks.
//!
//! # Example
//!
//! ```rust,no_run
//! use config::{GraphPlan, RuntimeConfig};
//! use dataflow_actors::{ActorSystem, Collected, KernelRegistry};
//! use network::{LoopbackConfig, LoopbackTransport};
//! use std::sync::Arc;
//!
//! # async fn run(plan: GraphPlan) -> anyhow::Result<()> {
//! let transport = Arc::new(LoopbackTransport::new(
//!     tokio::runtime::Handle::current(),
//!     LoopbackConfig::default(),
//! ));
//! let collected = Collected::default();
//! let handle = ActorSystem::new(RuntimeConfig::default(), transport)
//!     .with_kernels(KernelRegistry::with_builtins(collected.clone()))
//!     .launch(&plan)?;
//! let report = handle.wait().await?;
//! println!("{} pieces in {:?}", collected.len(), report.elapsed);
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod bus;
pub mod context;
pub mod error;
pub mod kernel;
pub mod messages;
pub mod metrics;
pub mod register;
pub mod system;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use actor::{Actor, ActorCore, ActorState, ComputeActor, NetworkCopyActor};
pub use bus::{Envelope, MessageBus};
pub use context::{ExecutionContext, WorkerContext};
pub use error::{ActorError, KernelError, Result};
pub use kernel::{Collect, Collected, Concat, CounterSource, Identity, Kernel, KernelRegistry};
pub use messages::{ActorCommand, ActorMessage, MessageKind};
pub use metrics::{ActorMetrics, ActorStats};
pub use register::{
    RegisterHandle, RegisterPool, RegisterRef, RegisterState, ReturnProgress, ReturnViolation,
};
pub use system::{
    ActorSystem, ControllerEvent, ControllerPolicy, GraphFailure, GraphHandle, GraphReport,
    CONTROLLER,
};
