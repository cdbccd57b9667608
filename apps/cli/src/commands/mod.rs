//! CLI command implementations.

pub mod checkpoints;
pub mod classify;
pub mod config;
pub mod run;

use anyhow::Context;
use cobalt_orchestrator::OrchestratorConfig;
use std::path::Path;

/// Resolves the orchestrator configuration for a command.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    OrchestratorConfig::discover_and_load(path).with_context(|| match path {
        Some(path) => format!("Failed to load config {}", path.display()),
        None => "Failed to load ./cobalt.toml".to_string(),
    })
}
