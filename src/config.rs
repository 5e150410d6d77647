//! Configuration module for Plover

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::paths;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// PDS service URL used for new logins
    #[serde(default = "default_service")]
    pub service: String,

    /// Suffix appended to bare identifiers at login (e.g. "alice" -> "alice.bsky.social")
    #[serde(default = "default_handle_suffix")]
    pub handle_suffix: String,

    /// Background token-refresh interval in seconds (0 = disabled)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Number of posts to fetch per timeline request
    #[serde(default = "default_post_limit")]
    pub post_limit: usize,
}

fn default_service() -> String {
    crate::api::DEFAULT_SERVICE.to_string()
}

fn default_handle_suffix() -> String {
    "bsky.social".to_string()
}

fn default_refresh_interval() -> u64 {
    900
}

fn default_post_limit() -> usize {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: default_service(),
            handle_suffix: default_handle_suffix(),
            refresh_interval_secs: default_refresh_interval(),
            post_limit: default_post_limit(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        paths::config_path()
    }

    /// Load config from the default path or create default
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        Self::load_from(&path)
    }

    /// Load config from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;

        Ok(())
    }
}
