//! Runtime defaults
//!
//! Default values used when neither the configuration file nor the
//! environment provides a setting.

/// Worker threads hosting actors
pub const WORKER_THREADS: usize = 4;

/// Registers per output port when a descriptor does not set a depth
pub const PIPELINE_DEPTH: usize = 2;

/// Time allowed for a graph to reach Terminal after the last source ends
pub const SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Default tracing filter directive
pub const LOG_LEVEL: &str = "info";

/// Prefix of environment variables overriding configuration
pub const ENV_PREFIX: &str = "DATAFLOW";
