//! Configuration loading for sync-client.
//!
//! Configuration is loaded from a TOML file; every field has a default, so
//! an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between fallback polls (default: 30).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum messages returned by one poll (default: 200).
    #[serde(default = "default_poll_page_limit")]
    pub poll_page_limit: usize,
    /// Messages loaded when a conversation opens (default: 100).
    #[serde(default = "default_initial_page_size")]
    pub initial_page_size: usize,
    /// Maximum optimistic sends awaiting acknowledgement (default: 32).
    #[serde(default = "default_max_in_flight_sends")]
    pub max_in_flight_sends: usize,
    /// Blob storage bucket for attachments (default: "chat-attachments").
    #[serde(default = "default_attachment_bucket")]
    pub attachment_bucket: String,
    /// Mark the conversation read whenever the visible count changes
    /// (default: true).
    #[serde(default = "default_mark_read_on_change")]
    pub mark_read_on_change: bool,
}

// Default value functions
fn default_poll_interval_secs() -> u64 {
    30
}

fn default_poll_page_limit() -> usize {
    200
}

fn default_initial_page_size() -> usize {
    100
}

fn default_max_in_flight_sends() -> usize {
    32
}

fn default_attachment_bucket() -> String {
    "chat-attachments".to_string()
}

fn default_mark_read_on_change() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_page_limit: default_poll_page_limit(),
            initial_page_size: default_initial_page_size(),
            max_in_flight_sends: default_max_in_flight_sends(),
            attachment_bucket: default_attachment_bucket(),
            mark_read_on_change: default_mark_read_on_change(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Poll interval as a duration. Zero is clamped to one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
