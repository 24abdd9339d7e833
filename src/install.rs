//! Dependency installation
//!
//! Thin, idempotent wrappers around the external package managers:
//! `apt-get` for OS packages, `pip3` for the application's requirements
//! manifest, plus the optional provision command. Installation is
//! re-run only when the dependency fingerprint changes; the engine
//! decides that, this module just executes.

use anyhow::{Context, Result, bail};
use blake3::Hasher;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::StaticConfig;
use crate::error::Error;

/// OS packages every managed service needs, installed alongside the
/// configured extras.
const BASE_PACKAGES: &[&str] = &["python3-pip", "python3-setuptools", "gunicorn"];

/// Executes installation steps on behalf of the engine.
///
/// The engine is written against this trait so passes can be exercised
/// in tests without touching the package managers.
pub trait Installer {
    /// Idempotently ensure OS packages, the service user, and the
    /// requirements manifest are installed.
    fn ensure(
        &mut self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Run the configured provision command in the application root.
    fn provision(
        &mut self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

impl<T: Installer + ?Sized> Installer for &mut T {
    fn ensure(
        &mut self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        (**self).ensure(config, environment)
    }

    fn provision(
        &mut self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        (**self).provision(config, environment)
    }
}

/// Fingerprint of the inputs that gate a re-installation cycle: the
/// sorted apt package set and the requirements manifest content.
///
/// Environment-only changes leave this value untouched, so they never
/// re-trigger installation.
pub fn fingerprint(config: &StaticConfig) -> String {
    let mut hasher = Hasher::new();
    for package in config.apt_packages() {
        hasher.update(package.as_bytes());
        hasher.update(b"\n");
    }
    if let Ok(requirements) = fs::read(config.app_root().join("requirements.txt")) {
        hasher.update(&requirements);
    }
    hasher.finalize().to_hex().to_string()
}

/// Real installer backed by apt-get, useradd, and pip3.
#[derive(Debug)]
pub struct SystemInstaller {
    state_dir: PathBuf,
}

impl SystemInstaller {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn apt_install(&self, config: &StaticConfig) -> Result<()> {
        let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|p| (*p).to_string()).collect();
        packages.extend(config.apt_packages());

        log::info!("Installing OS packages: {}", packages.join(" "));
        let output = Command::new("apt-get")
            .arg("install")
            .arg("-y")
            .args(&packages)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .output()
            .context("Failed to run apt-get")?;

        if !output.status.success() {
            bail!(
                "apt-get install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn ensure_user(&self, username: &str) -> Result<()> {
        let exists = Command::new("id")
            .args(["-u", username])
            .output()
            .context("Failed to run id")?
            .status
            .success();

        if exists {
            return Ok(());
        }

        log::info!("Creating service user {username}");
        let output = Command::new("useradd")
            .args(["--system", username])
            .output()
            .context("Failed to run useradd")?;

        if !output.status.success() {
            bail!(
                "useradd failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn pip_install(
        &self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<()> {
        let app_root = config.app_root();
        let requirements = app_root.join("requirements.txt");
        if !requirements.is_file() {
            log::debug!("No requirements manifest at {}", requirements.display());
            return Ok(());
        }

        let mut command = Command::new("pip3");
        command.arg("install");

        // A local cache takes precedence over network fetch
        if let Some(cache) = &config.pip_cache_dir {
            let cache_dir = app_root.join(cache);
            log::info!("Installing pip requirements from {}", cache_dir.display());
            command.arg("--no-index").arg("--find-links").arg(cache_dir);
        } else {
            log::info!("Installing pip requirements from the package index");
        }

        let output = command
            .arg("--requirement")
            .arg("requirements.txt")
            .current_dir(&app_root)
            .env("LC_ALL", "C.UTF-8")
            .envs(environment)
            .output()
            .context("Failed to run pip3")?;

        if !output.status.success() {
            bail!(
                "pip3 install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn run_provision_command(
        &self,
        config: &StaticConfig,
        command_line: &str,
        environment: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("provision command is empty");
        };

        let _lock = ProvisionLock::acquire(&self.state_dir)?;

        log::info!("Running provision command: {command_line}");
        let output = Command::new(program)
            .args(parts)
            .current_dir(config.app_root())
            .envs(environment)
            .output()
            .with_context(|| format!("Failed to run provision command {program}"))?;

        if !output.stdout.is_empty() {
            log::debug!(
                "provision stdout: {}",
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }
        if !output.status.success() {
            bail!(
                "provision command exited {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl Installer for SystemInstaller {
    fn ensure(
        &mut self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.apt_install(config)
            .and_then(|()| self.ensure_user(&config.username))
            .and_then(|()| self.pip_install(config, environment))
            .map_err(|e| Error::InstallFailure {
                detail: format!("{e:#}"),
            })
    }

    fn provision(
        &mut self,
        config: &StaticConfig,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let Some(command_line) = config.provision_command.clone() else {
            return Ok(());
        };

        self.run_provision_command(config, &command_line, environment)
            .map_err(|e| Error::InstallFailure {
                detail: format!("{e:#}"),
            })
    }
}

/// Scoped marker held while the provision command runs, so overlapping
/// passes cannot double-provision.
struct ProvisionLock {
    path: PathBuf,
}

impl ProvisionLock {
    fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(".provisioning");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("provisioning already in progress ({})", path.display())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to create lock at {}", path.display()))
            }
        }
    }
}

impl Drop for ProvisionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_changes_with_apt_set() {
        let config = StaticConfig::default();
        let base = fingerprint(&config);

        let config = StaticConfig {
            apt_dependencies: "libpq-dev".to_string(),
            ..Default::default()
        };
        assert_ne!(base, fingerprint(&config));
    }

    #[test]
    fn test_fingerprint_ignores_package_declaration_order() {
        let first = StaticConfig {
            apt_dependencies: "libpq-dev libxml2".to_string(),
            ..Default::default()
        };
        let second = StaticConfig {
            apt_dependencies: "libxml2 libpq-dev".to_string(),
            ..Default::default()
        };
        assert_eq!(fingerprint(&first), fingerprint(&second));
    }

    #[test]
    fn test_fingerprint_unchanged_by_environment() {
        let first = StaticConfig::default();
        let second = StaticConfig {
            environment_variables: "DEBUG=1".to_string(),
            port: 9999,
            ..Default::default()
        };
        assert_eq!(fingerprint(&first), fingerprint(&second));
    }

    #[test]
    fn test_fingerprint_tracks_requirements_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = StaticConfig {
            application_root: dir.path().display().to_string(),
            ..Default::default()
        };

        let without = fingerprint(&config);
        fs::write(dir.path().join("requirements.txt"), "flask==3.0\n").unwrap();
        let with = fingerprint(&config);
        assert_ne!(without, with);

        fs::write(dir.path().join("requirements.txt"), "flask==3.1\n").unwrap();
        assert_ne!(with, fingerprint(&config));
    }

    #[test]
    fn test_provision_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();

        let held = ProvisionLock::acquire(dir.path()).unwrap();
        assert!(ProvisionLock::acquire(dir.path()).is_err());

        drop(held);
        assert!(ProvisionLock::acquire(dir.path()).is_ok());
    }
}
