//! Dataflow Network Transport
//!
//! Transport layer consumed by the actor runtime for cross-node register
//! copies. The runtime treats the transport as opaque: it registers a
//! payload under a token, asks for that token to be copied into a local
//! buffer, and later receives exactly one completion or failure event.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   begin_transfer    ┌──────────────────────┐
//! │ NetworkCopyActor │ ──────────────────> │      Transport       │
//! │  (worker thread) │                     │  registered memory   │
//! └──────────────────┘                     │  + async copy tasks  │
//!          ^                               └──────────────────────┘
//!          │ TransferComplete message                 │
//!          └──── CompletionNotifier (actor inbox) <───┘
//! ```
//!
//! `LoopbackTransport` implements the contract in-process on a tokio
//! runtime, with latency, jitter and fault injection for testing.

pub mod error;
pub mod loopback;
pub mod metrics;
pub mod transfer;

pub use error::{Result, TransportError};
pub use loopback::{LoopbackConfig, LoopbackTransport};
pub use metrics::{TransportMetrics, TransportStats};
pub use transfer::{
    CompletionNotifier, MemoryToken, Transport, TransferEvent, TransferOutcome, TransferRequest,
};
