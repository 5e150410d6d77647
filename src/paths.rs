//! Common paths for Plover data storage
//!
//! All Plover data is stored under ~/.config/plover/ on all platforms:
//! - config.toml - User configuration
//! - sessions.enc - Encrypted account credentials

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Get the Plover data directory (~/.config/plover/)
///
/// This is consistent across all platforms for simplicity.
pub fn plover_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let dir = home.join(".config").join("plover");
    fs::create_dir_all(&dir).context("Failed to create plover directory")?;
    Ok(dir)
}

/// Get the config file path (~/.config/plover/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(plover_dir()?.join("config.toml"))
}

/// Get the session store path (~/.config/plover/sessions.enc)
pub fn sessions_path() -> Result<PathBuf> {
    Ok(plover_dir()?.join("sessions.enc"))
}
