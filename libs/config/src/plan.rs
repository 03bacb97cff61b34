//! Graph Plans
//!
//! A graph plan is the list of task descriptors produced by graph
//! compilation, stored as TOML with one `[[tasks]]` table per actor.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;
use types::{validate_graph, DescriptorError, TaskDescriptor};

/// Task descriptors for one graph
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GraphPlan {
    #[serde(default)]
    pub name: Option<String>,
    pub tasks: Vec<TaskDescriptor>,
}

impl GraphPlan {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self { name: None, tasks }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse graph plan")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph plan {:?}", path))?;
        let plan = Self::from_toml_str(&text)?;
        info!(
            plan = plan.name.as_deref().unwrap_or("unnamed"),
            tasks = plan.tasks.len(),
            "Loaded graph plan"
        );
        Ok(plan)
    }

    /// Check every descriptor and every edge of the graph
    pub fn validate(&self, default_depth: usize) -> std::result::Result<(), DescriptorError> {
        validate_graph(&self.tasks, default_depth)
    }
}
