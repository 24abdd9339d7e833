//! Static configuration for the managed WSGI service
//!
//! Loaded from `<config_dir>/config.toml`. Every key has a default so a
//! missing file yields a usable configuration. List-valued keys keep the
//! space-separated string form they arrive in and are parsed on demand.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

/// Static configuration record for the managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Listen port for the WSGI server
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional shell command run once per installation cycle, before
    /// the service is (re)configured
    #[serde(default)]
    pub provision_command: Option<String>,

    /// Optional local package cache, relative to the application root
    #[serde(default)]
    pub pip_cache_dir: Option<String>,

    /// `module:callable` path of the WSGI entry point
    #[serde(default = "default_wsgi_module")]
    pub wsgi_module: String,

    /// Absolute path the server logs to
    #[serde(default = "default_logfile_path")]
    pub wsgi_logfile_path: String,

    /// Space-separated list of OS packages the application needs
    #[serde(default)]
    pub apt_dependencies: String,

    /// Space-separated list of `KEY=VAL` environment declarations
    #[serde(default)]
    pub environment_variables: String,

    /// Directory the application source is staged into
    #[serde(default = "default_application_root")]
    pub application_root: String,

    /// User the service runs as
    #[serde(default = "default_username")]
    pub username: String,

    /// Base name of the OS service definition
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_port() -> u16 {
    80
}

fn default_wsgi_module() -> String {
    "wsgi:application".to_string()
}

fn default_logfile_path() -> String {
    "/var/log/gunicorn.log".to_string()
}

fn default_application_root() -> String {
    "/srv".to_string()
}

fn default_username() -> String {
    "wsgi".to_string()
}

fn default_service_name() -> String {
    "gunicorn".to_string()
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            provision_command: None,
            pip_cache_dir: None,
            wsgi_module: default_wsgi_module(),
            wsgi_logfile_path: default_logfile_path(),
            apt_dependencies: String::new(),
            environment_variables: String::new(),
            application_root: default_application_root(),
            username: default_username(),
            service_name: default_service_name(),
        }
    }
}

impl StaticConfig {
    /// Load config.toml from the steward config directory, or defaults
    /// if the file doesn't exist
    pub fn load() -> Result<Self> {
        let path = paths::config_dir()?.join("config.toml");
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// The configured OS packages as a sorted set
    pub fn apt_packages(&self) -> BTreeSet<String> {
        self.apt_dependencies
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// The configured environment declarations, in declaration order.
    ///
    /// Declarations whose key is not a valid shell variable name are
    /// dropped with a warning. Duplicate keys are kept here; the
    /// renderer applies last-write-wins when building the final map.
    pub fn environment(&self) -> Vec<(String, String)> {
        let key_pattern = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static pattern");

        let mut pairs = Vec::new();
        for declaration in self.environment_variables.split_whitespace() {
            match declaration.split_once('=') {
                Some((key, value)) if key_pattern.is_match(key) => {
                    pairs.push((key.to_string(), value.to_string()));
                }
                _ => {
                    log::warn!("Ignoring malformed environment declaration: {declaration}");
                }
            }
        }
        pairs
    }

    /// Expanded application root path
    pub fn app_root(&self) -> PathBuf {
        paths::expand(&self.application_root)
    }
}

// ============================================================================
// Tests
// ============================================================================
