//! Test utilities for the updater.
//!
//! In-memory fakes for every OS and network seam, so orchestration can be
//! exercised without GitHub, `systemctl` or `pkill`:
//!
//! - [`FakeReleaseSource`] serves registered releases and asset bodies
//! - [`FakeProcesses`] answers self-reports and records terminations
//! - [`FakeServiceManager`] keeps unit activation state in memory
//!
//! The fakes can share a [`Journal`] so a test can assert the order of
//! events across seams, e.g. that a service was stopped before its binary
//! was fetched.
//!
//! # Example
//!
//! ```rust,no_run
//! use vpnmupd::test_utils::{FakeProcesses, FakeReleaseSource, Journal};
//!
//! let journal = Journal::default();
//! let source = FakeReleaseSource::default()
//!     .with_release("anatolio-deb", "vpnm", "v0.4.0", &[("vpnm", "https://dl/vpnm")])
//!     .with_body("https://dl/vpnm", b"binary")
//!     .with_journal(journal.clone());
//! let processes = FakeProcesses::default().with_report("vpnm", "vpnm 0.3.1");
//! ```

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::{DependencySpec, RetryPolicy, UpdaterConfig};
use crate::core::UpdaterError;
use crate::process::ProcessControl;
use crate::release::{LatestRelease, Payload, ReleaseAsset, ReleaseSource};
use crate::service::ServiceManager;
use crate::utils::ProgressBar;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Uses `level` when given, otherwise `RUST_LOG`. Without either, nothing is
/// installed. Safe to call from every test.
///
/// ```bash
/// RUST_LOG=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}

/// An ordered record of events shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Append an event.
    pub fn record(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.into());
        }
    }

    /// All events so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Events starting with `prefix`, with the prefix and one space removed.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{prefix} ");
        self.events()
            .into_iter()
            .filter_map(|event| event.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Position of the first event equal to `event`.
    #[must_use]
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

/// [`ReleaseSource`] serving registered releases from memory.
///
/// Looking up an unregistered repository fails, as does fetching a URL with
/// no registered body.
#[derive(Debug, Clone, Default)]
pub struct FakeReleaseSource {
    releases: HashMap<(String, String), LatestRelease>,
    bodies: HashMap<String, Vec<u8>>,
    fetch_delay: Option<Duration>,
    journal: Journal,
}

impl FakeReleaseSource {
    /// Register (or replace) the latest release of `owner/repo`.
    #[must_use]
    pub fn with_release(mut self, owner: &str, repo: &str, tag: &str, assets: &[(&str, &str)]) -> Self {
        let release = LatestRelease {
            tag_name: tag.to_string(),
            assets: assets
                .iter()
                .map(|(name, url)| ReleaseAsset {
                    name: (*name).to_string(),
                    browser_download_url: (*url).to_string(),
                })
                .collect(),
        };
        self.releases.insert((owner.to_string(), repo.to_string()), release);
        self
    }

    /// Serve `bytes` at `url`.
    #[must_use]
    pub fn with_body(mut self, url: &str, bytes: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), bytes.to_vec());
        self
    }

    /// Sleep this long before answering every fetch.
    #[must_use]
    pub const fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Record events into `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// URLs fetched so far.
    #[must_use]
    pub fn fetched(&self) -> Vec<String> {
        self.journal.with_prefix("fetch")
    }

    /// Number of release lookups so far.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.journal.with_prefix("latest").len()
    }
}

impl ReleaseSource for FakeReleaseSource {
    fn latest<'a>(&'a self, owner: &'a str, repo: &'a str) -> BoxFuture<'a, Result<LatestRelease>> {
        Box::pin(async move {
            self.journal.record(format!("latest {owner}/{repo}"));
            self.releases
                .get(&(owner.to_string(), repo.to_string()))
                .cloned()
                .ok_or_else(|| anyhow!("no release registered for {owner}/{repo}"))
        })
    }

    fn fetch<'a>(&'a self, url: &'a str, progress: &'a ProgressBar) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            self.journal.record(format!("fetch {url}"));
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }

            let bytes = self.bodies.get(url).cloned().ok_or_else(|| UpdaterError::TransportFailed {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            })?;

            let len = bytes.len() as u64;
            progress.set_length(len);
            progress.inc(len);
            Ok(Payload {
                content_length: Some(len),
                bytes,
            })
        })
    }
}

/// [`ProcessControl`] answering self-reports from memory.
///
/// Self-reports are keyed by executable file name; an executable without a
/// registered report fails to run.
#[derive(Debug, Clone, Default)]
pub struct FakeProcesses {
    reports: HashMap<String, String>,
    journal: Journal,
}

impl FakeProcesses {
    /// Make `executable` print `output` when asked for its version.
    #[must_use]
    pub fn with_report(mut self, executable: &str, output: &str) -> Self {
        self.reports.insert(executable.to_string(), output.to_string());
        self
    }

    /// Record events into `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Process names terminated so far.
    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        self.journal.with_prefix("terminate")
    }
}

impl ProcessControl for FakeProcesses {
    fn self_report<'a>(&'a self, executable: &'a Path) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let name = executable.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            self.reports
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("{} exited with status 127", executable.display()))
        })
    }

    fn terminate<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.journal.record(format!("terminate {name}"));
            Ok(())
        })
    }
}

/// [`ServiceManager`] keeping activation state in memory.
#[derive(Debug, Clone, Default)]
pub struct FakeServiceManager {
    active: Arc<Mutex<HashSet<String>>>,
    failing_start: bool,
    journal: Journal,
}

impl FakeServiceManager {
    /// Make every `enable --now` fail.
    #[must_use]
    pub const fn failing_start(mut self) -> Self {
        self.failing_start = true;
        self
    }

    /// Start with `unit` already active.
    #[must_use]
    pub fn with_active(self, unit: &str) -> Self {
        if let Ok(mut active) = self.active.lock() {
            active.insert(unit.to_string());
        }
        self
    }

    /// Record events into `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Number of `daemon-reload` calls.
    #[must_use]
    pub fn reloads(&self) -> usize {
        self.journal.events().iter().filter(|e| *e == "daemon-reload").count()
    }

    /// Number of calls of `command` (`enable` or `disable`).
    #[must_use]
    pub fn calls_for(&self, command: &str) -> usize {
        self.journal.with_prefix(command).len()
    }

    fn set_active(&self, unit: &str, active: bool) {
        if let Ok(mut units) = self.active.lock() {
            if active {
                units.insert(unit.to_string());
            } else {
                units.remove(unit);
            }
        }
    }
}

impl ServiceManager for FakeServiceManager {
    fn is_active<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.active.lock().is_ok_and(|units| units.contains(unit)) })
    }

    fn enable_now<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.journal.record(format!("enable {unit}"));
            if self.failing_start {
                return Err(anyhow!("Job for {unit} failed because the control process exited with error code."));
            }
            self.set_active(unit, true);
            Ok(String::new())
        })
    }

    fn disable_now<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.journal.record(format!("disable {unit}"));
            self.set_active(unit, false);
            Ok(String::new())
        })
    }

    fn daemon_reload(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.journal.record("daemon-reload");
            Ok(String::new())
        })
    }
}

/// Write a zip archive holding `entries` to `path`.
///
/// # Errors
///
/// Fails when the file cannot be created or written.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> zip::result::ZipResult<()> {
    let mut writer = zip::ZipWriter::new(std::fs::File::create(path)?);
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(bytes)?;
    }
    writer.finish()?;
    Ok(())
}

/// An isolated filesystem layout for orchestration tests.
///
/// Install, staging and unit directories live under one temporary
/// directory that is removed on drop. The retry policy is shortened so
/// lock-retry paths finish quickly.
pub struct TestEnvironment {
    /// Owns the temporary tree
    pub temp_dir: TempDir,
    /// Configuration pointing into the temporary tree
    pub config: UpdaterConfig,
}

impl TestEnvironment {
    /// A layout tracking `dependencies`.
    ///
    /// # Errors
    ///
    /// Fails when the temporary directories cannot be created.
    pub fn new(dependencies: Vec<DependencySpec>) -> std::io::Result<Self> {
        init_test_logging(None);

        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let config = UpdaterConfig {
            install_dir: root.join("bin"),
            staging_dir: root.join("staging"),
            unit_dir: root.join("units"),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 2,
                max_delay_ms: 4,
            },
            dependencies,
            ..UpdaterConfig::default()
        };
        for dir in [&config.install_dir, &config.staging_dir, &config.unit_dir] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            temp_dir,
            config,
        })
    }

    /// Path of an installed file.
    #[must_use]
    pub fn installed(&self, name: &str) -> PathBuf {
        self.config.install_dir.join(name)
    }

    /// Pretend `name` is already installed.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be written.
    pub fn install(&self, name: &str, contents: &[u8]) -> std::io::Result<()> {
        std::fs::write(self.installed(name), contents)
    }

    /// Path of a generated unit file.
    #[must_use]
    pub fn unit(&self, name: &str) -> PathBuf {
        self.config.unit_dir.join(format!("{name}.service"))
    }
}
