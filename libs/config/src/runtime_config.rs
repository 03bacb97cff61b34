//! Runtime Configuration Module
//!
//! Loads `RuntimeConfig` from an optional TOML file with environment
//! overrides. Environment variables use the `DATAFLOW_` prefix and `__`
//! for nesting, e.g. `DATAFLOW_WORKER_THREADS=8` or
//! `DATAFLOW_LOGGING__JSON=true`.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Top-level runtime configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads actors are distributed over
    pub worker_threads: usize,

    /// Pipeline depth for output ports whose descriptor does not set one
    pub default_pipeline_depth: usize,

    /// Upper bound on waiting for a launched graph to finish
    pub shutdown_timeout_ms: u64,

    pub logging: LoggingConfig,

    pub transport: TransportSettings,
}

/// Logging output settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Loopback transport simulation settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TransportSettings {
    pub latency_us: u64,
    pub jitter_us: u64,
    pub failure_rate: f64,
    pub seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: defaults::WORKER_THREADS,
            default_pipeline_depth: defaults::PIPELINE_DEPTH,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
            logging: LoggingConfig::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

impl TransportSettings {
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_micros(self.jitter_us)
    }
}

impl RuntimeConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading runtime config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        } else {
            debug!("No runtime config file given, using defaults");
        }

        builder = builder.add_source(Self::environment());

        let config = builder
            .build()
            .context("Failed to build runtime configuration")?;
        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize runtime configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .context("Failed to parse runtime configuration")?
            .try_deserialize()
            .context("Failed to deserialize runtime configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no graph could run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.default_pipeline_depth == 0 {
            bail!("default_pipeline_depth must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.transport.failure_rate) {
            bail!(
                "transport.failure_rate must be within [0, 1], got {}",
                self.transport.failure_rate
            );
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn environment() -> Environment {
        Environment::with_prefix(defaults::ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }
}
