//! Service control
//!
//! Applies a rendered desired state to the OS service definition and
//! drives the process supervisor. The environment and unit files are
//! replaced atomically before systemd is signaled, so a crash mid-apply
//! never leaves a half-written definition behind.

use anyhow::{Context, Result, bail};
use std::fs;
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::error::Error;
use crate::paths;
use crate::render::DesiredState;

/// How many times to poll for the service to come up, and how long to
/// pause between polls.
const READY_ATTEMPTS: u32 = 10;
const READY_PAUSE: Duration = Duration::from_secs(6);

/// Drives the process supervisor on behalf of the engine.
///
/// The engine is written against this trait so passes can be exercised
/// in tests without a running systemd.
pub trait Supervisor {
    /// Write the rendered definition, reload the supervisor, and start
    /// or restart the service.
    fn apply(&mut self, desired: &DesiredState) -> Result<(), Error>;

    /// Whether the service is currently running.
    fn is_running(&self, service_name: &str) -> bool;

    /// Stop the service.
    fn stop(&mut self, service_name: &str) -> Result<(), Error>;
}

impl<T: Supervisor + ?Sized> Supervisor for &mut T {
    fn apply(&mut self, desired: &DesiredState) -> Result<(), Error> {
        (**self).apply(desired)
    }

    fn is_running(&self, service_name: &str) -> bool {
        (**self).is_running(service_name)
    }

    fn stop(&mut self, service_name: &str) -> Result<(), Error> {
        (**self).stop(service_name)
    }
}

/// Real controller backed by systemd.
#[derive(Debug, Default)]
pub struct SystemdSupervisor;

impl SystemdSupervisor {
    pub fn new() -> Self {
        Self
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .context("Failed to run systemctl")?;

        if !output.status.success() {
            bail!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn apply_inner(&self, desired: &DesiredState) -> Result<()> {
        let name = &desired.unit.service_name;
        let unit = format!("{name}.service");

        let env_path = paths::env_file(name);
        log::info!("Writing environment file to {}", env_path.display());
        write_atomic(&env_path, &desired.env_file_body())?;

        let unit_path = paths::unit_file(name);
        log::info!("Writing unit file to {}", unit_path.display());
        write_atomic(&unit_path, &desired.unit_file_body())?;

        self.systemctl(&["daemon-reload"])?;

        if self.is_running(name) {
            log::info!("Restarting {unit}");
            self.systemctl(&["restart", &unit])?;
        } else {
            log::info!("Starting {unit}");
            self.systemctl(&["start", &unit])?;
        }

        self.wait_responsive(name, desired.unit.port)
    }

    /// Poll until the unit is active and the port accepts connections.
    fn wait_responsive(&self, service_name: &str, port: u16) -> Result<()> {
        for attempt in 0..READY_ATTEMPTS {
            log::debug!("Waiting for service on port {port} (attempt {attempt})");
            if self.is_running(service_name) && is_port_open(port) {
                log::info!("Service responded on port {port}");
                return Ok(());
            }
            thread::sleep(READY_PAUSE);
        }
        bail!("service not responding on port {port}")
    }
}

impl Supervisor for SystemdSupervisor {
    fn apply(&mut self, desired: &DesiredState) -> Result<(), Error> {
        self.apply_inner(desired).map_err(|e| Error::ApplyFailure {
            detail: format!("{e:#}"),
        })
    }

    fn is_running(&self, service_name: &str) -> bool {
        Command::new("systemctl")
            .args(["is-active", "--quiet", &format!("{service_name}.service")])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn stop(&mut self, service_name: &str) -> Result<(), Error> {
        self.systemctl(&["stop", &format!("{service_name}.service")])
            .map_err(|e| Error::ApplyFailure {
                detail: format!("{e:#}"),
            })
    }
}

/// Check if a local port accepts connections
fn is_port_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok()
}

/// Replace a file's contents atomically: write to a temporary file in
/// the same directory, then rename over the target.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())
        .context("Failed to write temp file")?;
    tmp.as_file()
        .sync_all()
        .context("Failed to sync temp file")?;

    let file = tmp
        .persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    file.set_permissions(fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Publish the listening endpoint for the reverse-proxy consumer.
///
/// Written once the service reaches the active phase, at a well-known
/// location in the state directory.
pub fn publish_website(state_dir: &Path, port: u16) -> Result<()> {
    let host = Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    let descriptor = serde_json::json!({ "host": host, "port": port });
    let path = state_dir.join("website.json");
    write_atomic(&path, &format!("{}\n", serde_json::to_string_pretty(&descriptor)?))?;
    log::info!("Published website endpoint {host}:{port}");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
