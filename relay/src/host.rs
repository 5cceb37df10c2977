//! Host process management
//!
//! Launches the desktop host binary with a throwaway copy of the profile and
//! the Test Agent app, and tears it down once the run is over.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::HostError;

/// How to launch the host
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub binary: PathBuf,
    pub profile: PathBuf,
    pub app_name: String,
    /// Time given to the host before the Test Agent is expected to connect
    pub startup_delay: Duration,
}

impl HostConfig {
    /// Arguments passed to the host binary for the given profile copy.
    pub fn command_args(&self, profile_dir: &Path) -> Vec<String> {
        vec![
            "-profile".to_string(),
            profile_dir.display().to_string(),
            "--runapp".to_string(),
            self.app_name.clone(),
        ]
    }
}

/// Starts a host for a run.
pub trait HostProcess {
    fn launch(&self, config: &HostConfig) -> Result<Box<dyn HostHandle>, HostError>;
}

/// A launched host, owned by the relay until the run is over.
pub trait HostHandle: Send {
    fn pid(&self) -> u32;

    /// Fails with [`HostError::ExitedEarly`] once the host has exited.
    fn check_running(&mut self) -> Result<(), HostError>;

    /// Stop the host and release what it holds. Safe to call twice.
    fn teardown(&mut self);
}

/// Give the host `delay` to start, failing if it exits in the meantime.
pub async fn wait_ready(host: &mut dyn HostHandle, delay: Duration) -> Result<(), HostError> {
    debug!("Waiting {:?} for host (pid: {}) to start", delay, host.pid());
    tokio::time::sleep(delay).await;
    host.check_running()
}

/// Launches [`DesktopHost`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopLauncher;

impl HostProcess for DesktopLauncher {
    fn launch(&self, config: &HostConfig) -> Result<Box<dyn HostHandle>, HostError> {
        Ok(Box::new(DesktopHost::launch(config)?))
    }
}

/// A running desktop host process
pub struct DesktopHost {
    pid: u32,
    profile_dir: PathBuf,
    child: Option<Child>,
    temp_dir: Option<TempDir>,
}

impl DesktopHost {
    /// Copy the profile and spawn the host binary.
    ///
    /// A bare binary name is resolved through `PATH` at spawn time.
    pub fn launch(config: &HostConfig) -> Result<Self, HostError> {
        if is_explicit_path(&config.binary) && !config.binary.exists() {
            return Err(HostError::BinaryNotFound(config.binary.clone()));
        }
        if !config.profile.is_dir() {
            return Err(HostError::ProfileNotFound(config.profile.clone()));
        }

        let temp_dir = tempfile::Builder::new()
            .suffix(".testagent")
            .tempdir()?;
        let profile_dir = temp_dir.path().join("profile");
        copy_dir(&config.profile, &profile_dir)?;
        debug!("Copied profile {} to {}", config.profile.display(), profile_dir.display());

        let args = config.command_args(&profile_dir);
        info!("Launching host: {} {}", config.binary.display(), args.join(" "));

        let child = Command::new(&config.binary)
            .args(&args)
            .spawn()
            .map_err(HostError::Spawn)?;

        let pid = child.id();
        info!("Host started (pid: {})", pid);

        Ok(Self {
            pid,
            profile_dir,
            child: Some(child),
            temp_dir: Some(temp_dir),
        })
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }
}

impl HostHandle for DesktopHost {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn check_running(&mut self) -> Result<(), HostError> {
        let Some(child) = self.child.as_mut() else {
            return Err(HostError::ExitedEarly("torn down".to_string()));
        };

        match child.try_wait()? {
            Some(status) => Err(HostError::ExitedEarly(status.to_string())),
            None => Ok(()),
        }
    }

    /// Kill the host and remove the profile copy
    fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping host (pid: {})", self.pid);
            let _ = child.kill();
            let _ = child.wait();
        }

        if let Some(temp_dir) = self.temp_dir.take() {
            if let Err(e) = temp_dir.close() {
                warn!("Failed to remove profile copy: {e}");
            }
        }
    }
}

impl Drop for DesktopHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// True when `binary` names a location rather than a command to look up.
fn is_explicit_path(binary: &Path) -> bool {
    binary
        .parent()
        .is_some_and(|parent| !parent.as_os_str().is_empty())
}

/// Recursively copy `src` into `dst`, following symlinks.
fn copy_dir(src: &Path, dst: &Path) -> Result<(), HostError> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| HostError::ProfileCopy(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| HostError::ProfileCopy(e.to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
