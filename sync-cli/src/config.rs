//! Engine configuration loading for the CLI.

use anyhow::{Context, Result};
use convo_sync_client::EngineConfig;
use std::path::Path;

/// Load the engine configuration from `path`, or defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load engine config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Render a configuration as TOML.
pub fn render(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render engine config")
}
