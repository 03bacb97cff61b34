//! # Dataflow Runtime Configuration
//!
//! Configuration loading, graph plan parsing and logging setup for the
//! actor runtime.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use config::{init_logging, GraphPlan, RuntimeConfig};
//! use std::path::Path;
//!
//! let runtime = RuntimeConfig::load(Some(Path::new("runtime.toml")))?;
//! init_logging(&runtime.logging)?;
//! let plan = GraphPlan::load(Path::new("graph.toml"))?;
//! plan.validate(runtime.default_pipeline_depth)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod logging;
pub mod plan;
pub mod runtime_config;

pub use logging::init_logging;
pub use plan::GraphPlan;
pub use runtime_config::{LoggingConfig, RuntimeConfig, TransportSettings};
