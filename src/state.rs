//! Persisted engine state
//!
//! Everything the engine must remember across its own restarts lives in
//! `<state_dir>/state.toml`: the lifecycle flags, the current phase,
//! the applied-state hash, the dependency fingerprint, and the relation
//! store. A missing file yields the default state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::Phase;
use crate::relation::RelationStore;

/// Lifecycle flags exposed to collaborators.
///
/// Each flag is set once by its satisfying condition and cleared only
/// by an explicit reset, never implicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleFlags {
    /// Application source has been staged in the application root
    #[serde(default)]
    pub source_available: bool,

    /// OS and language dependencies are present
    #[serde(default)]
    pub dependencies_installed: bool,

    /// The service definition has been written at least once
    #[serde(default)]
    pub service_configured: bool,

    /// The service reached the active phase at least once
    #[serde(default)]
    pub service_active: bool,
}

/// Main persisted state of the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardState {
    /// Current phase of the state machine
    #[serde(default)]
    pub phase: Phase,

    /// Lifecycle flags
    #[serde(default)]
    pub flags: LifecycleFlags,

    /// Content hash of the last successfully applied desired state
    #[serde(default)]
    pub applied_hash: Option<String>,

    /// Fingerprint of the dependency inputs at the last successful
    /// installation cycle
    #[serde(default)]
    pub deps_fingerprint: Option<String>,

    /// Attached relation units and their incrementally merged fields
    #[serde(default)]
    pub relations: RelationStore,

    /// Last time the state was updated
    pub last_updated: DateTime<Utc>,
}

impl Default for StewardState {
    fn default() -> Self {
        Self {
            phase: Phase::default(),
            flags: LifecycleFlags::default(),
            applied_hash: None,
            deps_fingerprint: None,
            relations: RelationStore::default(),
            last_updated: Utc::now(),
        }
    }
}

impl StewardState {
    fn state_file(state_dir: &Path) -> PathBuf {
        state_dir.join("state.toml")
    }

    /// Load state from disk, or return default if the file doesn't exist
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::state_file(state_dir);

        if !path.exists() {
            log::debug!("State file does not exist, using default state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Save state to disk, stamping the update time
    pub fn save(&mut self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory: {}", state_dir.display()))?;

        self.last_updated = Utc::now();

        let path = Self::state_file(state_dir);
        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;

        fs::write(&path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Explicit reset: clear the lifecycle flags and return the machine
    /// to its initial phase.
    ///
    /// The applied hash is kept; it still describes what is on disk.
    pub fn reset(&mut self) {
        self.flags = LifecycleFlags::default();
        self.phase = Phase::Init;
    }
}

// ============================================================================
// Tests
// ============================================================================
