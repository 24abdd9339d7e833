//! Desired-state rendering
//!
//! Merges static configuration, the resolved relation descriptor, and
//! the source-presence signal into the two documents the service
//! controller writes: the environment file and the systemd unit.
//! Rendering is a pure function and byte-deterministic for identical
//! inputs; the engine's idempotence check hashes the rendered bodies.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::config::StaticConfig;
use crate::error::Error;
use crate::paths;
use crate::relation::RelationDescriptor;

/// Rendered service-unit parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitParams {
    pub service_name: String,
    pub username: String,
    pub application_root: PathBuf,
    pub port: u16,
    pub wsgi_module: String,
    pub log_path: String,
}

/// The complete desired state of the managed service: environment map
/// plus unit parameters. Derived, never stored independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub environment: BTreeMap<String, String>,
    pub unit: UnitParams,
}

impl DesiredState {
    /// Rendered environment file body: sorted `KEY=VALUE` lines
    pub fn env_file_body(&self) -> String {
        let mut body = String::new();
        for (key, value) in &self.environment {
            let _ = writeln!(body, "{key}={value}");
        }
        body
    }

    /// Rendered systemd unit body for the gunicorn service
    pub fn unit_file_body(&self) -> String {
        let env_file = paths::env_file(&self.unit.service_name);
        format!(
            "[Unit]\n\
             Description=WSGI application service ({name})\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             Group={user}\n\
             WorkingDirectory={root}\n\
             EnvironmentFile=-{env_file}\n\
             ExecStart=/usr/bin/gunicorn --bind 0.0.0.0:{port} --log-file {log} {module}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            name = self.unit.service_name,
            user = self.unit.username,
            root = self.unit.application_root.display(),
            env_file = env_file.display(),
            port = self.unit.port,
            log = self.unit.log_path,
            module = self.unit.wsgi_module,
        )
    }

    /// Content hash over both rendered bodies.
    ///
    /// This is the value persisted as the applied-state hash: equal
    /// hashes mean the on-disk service definition needs no rewrite.
    pub fn hash(&self) -> String {
        let mut hasher = Hasher::new();
        hasher.update(self.env_file_body().as_bytes());
        hasher.update(self.unit_file_body().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Render the desired state from current inputs.
///
/// Fails with `NotReady` until the application source has been staged.
/// The environment map starts from the configured declarations (last
/// write wins on duplicate keys); a ready database relation then
/// overwrites `DATABASE_URL`, since it reflects live infrastructure.
pub fn render(
    config: &StaticConfig,
    descriptor: &RelationDescriptor,
    source_present: bool,
) -> Result<DesiredState, Error> {
    if !source_present {
        return Err(Error::NotReady {
            what: "application source",
        });
    }

    let mut environment = BTreeMap::new();
    for (key, value) in config.environment() {
        environment.insert(key, value);
    }
    if let Some(url) = descriptor.database_url() {
        environment.insert("DATABASE_URL".to_string(), url);
    }

    Ok(DesiredState {
        environment,
        unit: UnitParams {
            service_name: config.service_name.clone(),
            username: config.username.clone(),
            application_root: config.app_root(),
            port: config.port,
            wsgi_module: config.wsgi_module.clone(),
            log_path: config.wsgi_logfile_path.clone(),
        },
    })
}

// ============================================================================
// Tests
// ============================================================================
