//! Centralized path resolution for steward
//!
//! This module provides path resolution with environment variable
//! support for the engine's own config and state, plus the fixed,
//! well-known locations of the rendered service definition.
//!
//! # Environment Variables
//!
//! - `STEWARD_CONFIG_DIR` - Override config directory
//! - `STEWARD_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `STEWARD_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/steward` (if set)
//! 3. Default: `~/.config/steward`
//!
//! For state_dir():
//! 1. `STEWARD_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/steward` (if set)
//! 3. Default: `~/.local/state/steward`
//!
//! The rendered unit file and environment file live at fixed system
//! paths derived from the configured service name; those are not
//! overridable because the process supervisor reads them from there.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "STEWARD_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "STEWARD_STATE_DIR";

/// Get the steward config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("steward");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join("steward");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the steward state directory path
///
/// Holds the persisted engine state (lifecycle flags, applied hash,
/// relation store), the pass lock, and the published website descriptor.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("steward");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("steward");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Path of the systemd unit file for a service name
pub fn unit_file(service_name: &str) -> PathBuf {
    PathBuf::from("/etc/systemd/system").join(format!("{service_name}.service"))
}

/// Path of the rendered environment file for a service name
pub fn env_file(service_name: &str) -> PathBuf {
    PathBuf::from("/etc/default").join(service_name)
}

/// Expand ~ and environment variables in a path string.
///
/// This is the canonical path expansion function for steward. All
/// modules should use this instead of calling shellexpand directly.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================
