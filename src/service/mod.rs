//! Service units for the privileged dependency and for the updater itself.
//!
//! A [`ServiceUnit`] is a generated systemd unit file bound to one
//! executable. It holds no state besides its rendered content: whether the
//! unit is absent, present or running is always asked of the OS service
//! manager on demand.
//!
//! ```text
//!             dump()                 start()
//!   Absent ──────────▶ Inactive ──────────────▶ Active
//!     ▲                  │    ◀──────────────     │
//!     │     remove()     │        stop()          │
//!     └──────────────────┴────────────────────────┘
//! ```
//!
//! Every operation is idempotent. Service manager failures are logged and
//! reported only through the returned state; they are never raised.

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::constants::SYSTEM_COMMAND_TIMEOUT;
use crate::files::LocalFile;

/// Commands understood by the OS service manager.
pub trait ServiceManager: Send + Sync {
    /// Whether `unit` is currently active. Any failure counts as inactive.
    fn is_active<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, bool>;

    /// Enable and start `unit`.
    fn enable_now<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Disable and stop `unit`.
    fn disable_now<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Reload unit definitions from disk.
    fn daemon_reload(&self) -> BoxFuture<'_, Result<String>>;
}

/// [`ServiceManager`] backed by `systemctl`.
#[derive(Debug, Clone, Default)]
pub struct Systemctl;

impl Systemctl {
    async fn run(args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            SYSTEM_COMMAND_TIMEOUT,
            Command::new("systemctl").args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("systemctl {} timed out", args.join(" ")))?
        .context("Failed to run systemctl")?;

        if !output.status.success() {
            bail!(
                "systemctl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ServiceManager for Systemctl {
    fn is_active<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            // `is-active` exits non-zero for every state but "active".
            Self::run(&["is-active", unit]).await.is_ok_and(|stdout| stdout.trim() == "active")
        })
    }

    fn enable_now<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Self::run(&["enable", "--now", unit]).await })
    }

    fn disable_now<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Self::run(&["disable", "--now", unit]).await })
    }

    fn daemon_reload(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(Self::run(&["daemon-reload"]))
    }
}

/// State of a unit as seen by the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// No unit file on disk
    Absent,
    /// Unit file present, service not running
    Inactive,
    /// Unit file present, service running
    Active,
}

/// A generated unit file for one executable.
#[derive(Clone)]
pub struct ServiceUnit {
    filename: String,
    location: PathBuf,
    content: String,
    manager: Arc<dyn ServiceManager>,
    verbose: bool,
}

impl fmt::Debug for ServiceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceUnit")
            .field("filename", &self.filename)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl ServiceUnit {
    /// A unit running `executable` directly.
    pub fn new(executable: &LocalFile, unit_dir: &Path, manager: Arc<dyn ServiceManager>) -> Self {
        let exec_start = executable.location().display().to_string();
        Self::with_command(executable.filename(), &exec_start, unit_dir, manager)
    }

    /// A unit named `name.service` running `exec_start`.
    pub fn with_command(
        name: &str,
        exec_start: &str,
        unit_dir: &Path,
        manager: Arc<dyn ServiceManager>,
    ) -> Self {
        let filename = format!("{name}.service");
        Self {
            location: unit_dir.join(&filename),
            content: Self::render(name, exec_start),
            filename,
            manager,
            verbose: false,
        }
    }

    /// Log service manager output at debug level.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The unit file body. Byte-for-byte stable for a given input.
    #[must_use]
    pub fn render(description: &str, exec_start: &str) -> String {
        format!(
            "[Unit]
Description={description}
After=network-online.target
Wants=network-online.target

[Service]
Restart=on-failure
ExecStart={exec_start}

[Install]
WantedBy=multi-user.target"
        )
    }

    /// Unit file name, e.g. `vpnmd.service`.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Unit file location.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Rendered unit body.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Whether the unit file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.location.exists()
    }

    /// Whether the service manager reports the unit as active.
    pub async fn is_active(&self) -> bool {
        self.manager.is_active(&self.filename).await
    }

    /// Current state, queried fresh.
    pub async fn state(&self) -> UnitState {
        if self.is_active().await {
            UnitState::Active
        } else if self.exists() {
            UnitState::Inactive
        } else {
            UnitState::Absent
        }
    }

    /// Write the unit file unless it already exists, then reload the
    /// service manager. An existing file is never overwritten.
    ///
    /// Returns whether the file exists afterwards.
    pub async fn dump(&self) -> bool {
        if !self.exists() {
            if let Err(e) = tokio::fs::write(&self.location, &self.content).await {
                error!(unit = %self.filename, path = %self.location.display(), error = %e, "Failed to write unit file");
                return self.exists();
            }
            info!(unit = %self.filename, path = %self.location.display(), "Wrote unit file");

            let result = self.manager.daemon_reload().await;
            self.log_result("daemon-reload", result);
        }
        self.exists()
    }

    /// Enable and start the service unless it is already active.
    ///
    /// Returns whether the service is active afterwards.
    pub async fn start(&self) -> bool {
        if !self.is_active().await {
            let result = self.manager.enable_now(&self.filename).await;
            self.log_result("enable --now", result);
        }
        self.is_active().await
    }

    /// Disable and stop the service if it is active.
    ///
    /// Returns whether the service is still active afterwards.
    pub async fn stop(&self) -> bool {
        if self.is_active().await {
            let result = self.manager.disable_now(&self.filename).await;
            self.log_result("disable --now", result);
        }
        self.is_active().await
    }

    /// Stop the service and delete its unit file.
    ///
    /// Returns whether the file still exists afterwards (`false` on success).
    pub async fn remove(&self) -> bool {
        if self.is_active().await {
            self.stop().await;
        }

        if self.exists() {
            match tokio::fs::remove_file(&self.location).await {
                Ok(()) => info!(unit = %self.filename, "Removed unit file"),
                Err(e) => {
                    error!(unit = %self.filename, error = %e, "Failed to remove unit file");
                }
            }
        }
        self.exists()
    }

    fn log_result(&self, action: &str, result: Result<String>) {
        match result {
            Ok(stdout) => {
                if self.verbose && !stdout.trim().is_empty() {
                    debug!(unit = %self.filename, action, "{}", stdout.trim_end());
                }
            }
            Err(e) => error!(unit = %self.filename, action, error = %format!("{e:#}"), "Service manager command failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeServiceManager;
    use tempfile::TempDir;

    fn unit_in(temp: &TempDir, manager: &FakeServiceManager) -> ServiceUnit {
        let exe = LocalFile::executable("/usr/local/bin", "vpnmd");
        ServiceUnit::new(&exe, temp.path(), Arc::new(manager.clone()))
    }

    #[test]
    fn test_render_template() {
        let expected = "[Unit]\nDescription=vpnmd\nAfter=network-online.target\nWants=network-online.target\n\n[Service]\nRestart=on-failure\nExecStart=/usr/local/bin/vpnmd\n\n[Install]\nWantedBy=multi-user.target";
        assert_eq!(ServiceUnit::render("vpnmd", "/usr/local/bin/vpnmd"), expected);
    }

    #[test]
    fn test_unit_location() {
        let manager = FakeServiceManager::default();
        let exe = LocalFile::executable("/usr/local/bin", "vpnmd");
        let unit = ServiceUnit::new(&exe, Path::new("/etc/systemd/system"), Arc::new(manager));
        assert_eq!(unit.filename(), "vpnmd.service");
        assert_eq!(unit.location(), Path::new("/etc/systemd/system/vpnmd.service"));
        assert!(unit.content().contains("ExecStart=/usr/local/bin/vpnmd"));
    }

    #[tokio::test]
    async fn test_dump_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manager = FakeServiceManager::default();
        let unit = unit_in(&temp, &manager);

        assert_eq!(unit.state().await, UnitState::Absent);
        assert!(unit.dump().await);
        assert_eq!(unit.state().await, UnitState::Inactive);
        assert_eq!(std::fs::read_to_string(unit.location()).unwrap(), unit.content());

        std::fs::write(unit.location(), "customized").unwrap();
        assert!(unit.dump().await);
        assert_eq!(std::fs::read_to_string(unit.location()).unwrap(), "customized");

        // Only the first dump reloads the manager.
        assert_eq!(manager.reloads(), 1);
    }

    #[tokio::test]
    async fn test_dump_into_missing_directory_reports_absent() {
        let temp = TempDir::new().unwrap();
        let manager = FakeServiceManager::default();
        let exe = LocalFile::executable("/usr/local/bin", "vpnmd");
        let unit = ServiceUnit::new(&exe, &temp.path().join("missing"), Arc::new(manager.clone()));

        assert!(!unit.dump().await);
        assert_eq!(manager.reloads(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp = TempDir::new().unwrap();
        let manager = FakeServiceManager::default();
        let unit = unit_in(&temp, &manager);
        unit.dump().await;

        assert!(unit.start().await);
        assert_eq!(unit.state().await, UnitState::Active);
        // Already active: no second enable.
        assert!(unit.start().await);
        assert_eq!(manager.calls_for("enable"), 1);

        assert!(!unit.stop().await);
        assert_eq!(unit.state().await, UnitState::Inactive);
        assert!(!unit.stop().await);
        assert_eq!(manager.calls_for("disable"), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        let manager = FakeServiceManager::default().failing_start();
        let unit = unit_in(&temp, &manager);
        unit.dump().await;

        assert!(!unit.start().await);
        assert_eq!(unit.state().await, UnitState::Inactive);
    }

    #[tokio::test]
    async fn test_remove_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let manager = FakeServiceManager::default();
        let unit = unit_in(&temp, &manager);
        unit.dump().await;
        unit.start().await;

        assert!(!unit.remove().await);
        assert!(!unit.exists());
        assert!(!unit.is_active().await);
        assert_eq!(unit.state().await, UnitState::Absent);

        // Removing again is a no-op.
        assert!(!unit.remove().await);
    }
}
