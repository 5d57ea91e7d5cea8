//! The orchestrator: owns every tracked dependency and runs check, install
//! and uninstall cycles over them.
//!
//! # Cycles
//!
//! - [`Orchestrator::check_all`] checks each dependency in configuration
//!   order. A failed lookup is logged and recorded in the report; it never
//!   stops the remaining checks.
//! - [`Orchestrator::install_updatable`] launches one Tokio task per selected
//!   dependency and hands back an [`InstallHandle`] per task. Before the
//!   service dependency's task is launched its unit is stopped so the running
//!   binary releases its file.
//! - [`Orchestrator::uninstall`] stops and removes the service unit, then
//!   deletes every installed executable.
//!
//! Cycles are serialized by an orchestrator-wide lock. Each dependency also
//! sits behind its own mutex; a launched install task owns that mutex until
//! it finishes, so a later check of the same dependency waits for it while
//! checks of other dependencies proceed.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::UpdaterConfig;
use crate::core::UpdaterError;
use crate::dependency::{Dependency, DependencyStatus};
use crate::files::Outcome;
use crate::process::{ProcessControl, SystemProcesses};
use crate::release::{GitHubReleases, ReleaseSource};
use crate::service::{ServiceManager, ServiceUnit, Systemctl};
use crate::utils::MultiProgress;

/// The OS and network seams the orchestrator drives.
#[derive(Clone)]
pub struct Backends {
    /// Where releases are looked up and downloaded from
    pub releases: Arc<dyn ReleaseSource>,
    /// Self-report and terminate-by-name
    pub processes: Arc<dyn ProcessControl>,
    /// The OS service manager
    pub services: Arc<dyn ServiceManager>,
}

impl Backends {
    /// GitHub, real processes and `systemctl`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn system(config: &UpdaterConfig, verbose: bool) -> Result<Self> {
        Ok(Self {
            releases: Arc::new(GitHubReleases::from_config(config)?),
            processes: Arc::new(SystemProcesses::new(verbose)),
            services: Arc::new(Systemctl),
        })
    }
}

/// Result of one check cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    /// Status of every dependency, in configuration order
    pub statuses: Vec<DependencyStatus>,
    /// Dependencies whose release lookup failed, with the reason
    pub failures: Vec<CheckFailure>,
}

impl CheckReport {
    /// Statuses flagged as updatable.
    #[must_use]
    pub fn updatable(&self) -> Vec<&DependencyStatus> {
        self.statuses.iter().filter(|status| status.updatable).collect()
    }
}

/// A dependency whose check failed.
#[derive(Debug, Clone, Serialize)]
pub struct CheckFailure {
    /// Executable name
    pub executable: String,
    /// Rendered error chain
    pub reason: String,
}

/// A launched install task.
pub struct InstallHandle {
    executable: String,
    dependency: Arc<Mutex<Dependency>>,
    handle: JoinHandle<Result<Vec<Outcome>>>,
}

impl InstallHandle {
    /// Name of the executable being installed.
    #[must_use]
    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// The dependency being installed. Locking it waits for the task.
    #[must_use]
    pub fn dependency(&self) -> Arc<Mutex<Dependency>> {
        Arc::clone(&self.dependency)
    }

    /// Whether the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task and return its permission outcomes.
    ///
    /// # Errors
    ///
    /// Returns the install error, or an error if the task panicked.
    pub async fn join(self) -> Result<Vec<Outcome>> {
        self.handle
            .await
            .with_context(|| format!("Install task for {} did not complete", self.executable))?
    }
}

/// The service unit stopped by an install cycle and the dependency whose
/// install it waits for.
struct PendingRestart {
    unit: ServiceUnit,
    dependency: Arc<Mutex<Dependency>>,
}

/// Owns the tracked dependencies and coordinates their updates.
pub struct Orchestrator {
    dependencies: Vec<Arc<Mutex<Dependency>>>,
    backends: Backends,
    unit_dir: PathBuf,
    cycle: Mutex<()>,
    pending: Mutex<Option<PendingRestart>>,
    progress: MultiProgress,
    verbose: bool,
}

impl Orchestrator {
    /// Build the dependency list from `config`.
    #[must_use]
    pub fn new(config: &UpdaterConfig, backends: Backends) -> Self {
        let dependencies = config
            .dependencies
            .iter()
            .map(|spec| Arc::new(Mutex::new(Dependency::new(spec, config))))
            .collect();

        Self {
            dependencies,
            backends,
            unit_dir: config.unit_dir.clone(),
            cycle: Mutex::new(()),
            pending: Mutex::new(None),
            progress: MultiProgress::disabled(),
            verbose: false,
        }
    }

    /// Draw download progress through `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Log service manager output.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The tracked dependencies, in configuration order.
    #[must_use]
    pub fn dependencies(&self) -> &[Arc<Mutex<Dependency>>] {
        &self.dependencies
    }

    /// Check every dependency for updates.
    pub async fn check_all(&self) -> CheckReport {
        let _cycle = self.cycle.lock().await;
        let mut report = CheckReport::default();

        for shared in &self.dependencies {
            let mut dependency = shared.lock().await;
            if let Err(e) = dependency
                .check(self.backends.releases.as_ref(), self.backends.processes.as_ref())
                .await
            {
                warn!(dependency = %dependency.name(), error = %format!("{e:#}"), "Check failed");
                report.failures.push(CheckFailure {
                    executable: dependency.name().to_string(),
                    reason: format!("{e:#}"),
                });
            }
            report.statuses.push(dependency.status());
        }

        info!(
            updatable = report.updatable().len(),
            failed = report.failures.len(),
            "Check cycle finished"
        );
        report
    }

    /// Status of the dependencies flagged by the last check.
    pub async fn updatable(&self) -> Vec<DependencyStatus> {
        let mut statuses = Vec::new();
        for shared in &self.dependencies {
            let dependency = shared.lock().await;
            if dependency.is_updatable() {
                statuses.push(dependency.status());
            }
        }
        statuses
    }

    /// Launch an install task for every updatable dependency, or for every
    /// dependency when `force` is set.
    ///
    /// The service dependency's unit is stopped before its task starts and
    /// kept for [`Orchestrator::restart_service`]. The service is not
    /// restarted here.
    pub async fn install_updatable(&self, force: bool) -> Vec<InstallHandle> {
        let _cycle = self.cycle.lock().await;
        let mut handles = Vec::new();

        for shared in &self.dependencies {
            let dependency = Arc::clone(shared).lock_owned().await;
            if !(force || dependency.is_updatable()) {
                continue;
            }

            if dependency.is_service() {
                let unit = ServiceUnit::new(
                    dependency.executable().file(),
                    &self.unit_dir,
                    Arc::clone(&self.backends.services),
                )
                .verbose(self.verbose);
                if unit.stop().await {
                    warn!(unit = %unit.filename(), "Service still active before install");
                }
                *self.pending.lock().await = Some(PendingRestart {
                    unit,
                    dependency: Arc::clone(shared),
                });
            }

            let executable = dependency.name().to_string();
            let bar = self.progress.download_bar(&executable, dependency.release().version_text());
            let backends = self.backends.clone();
            debug!(dependency = %executable, "Launching install");

            let handle = tokio::spawn(async move {
                let mut dependency = dependency;
                let result = dependency
                    .download(backends.releases.as_ref(), backends.processes.as_ref(), &bar)
                    .await;
                if let Err(e) = &result {
                    bar.finish_with_message("failed");
                    error!(dependency = %dependency.name(), error = %format!("{e:#}"), "Install failed");
                }
                result
            });

            handles.push(InstallHandle {
                executable,
                dependency: Arc::clone(shared),
                handle,
            });
        }

        info!(launched = handles.len(), force, "Install cycle launched");
        handles
    }

    /// Write and start the unit stopped by the last install cycle, then
    /// forget it.
    ///
    /// Waits for the service dependency's install task to finish. The unit
    /// is only started when that install succeeded; otherwise the service
    /// stays stopped and the result is `false`.
    ///
    /// Returns whether the service is active. Without a held unit there is
    /// nothing to restart and the result is `true`.
    pub async fn restart_service(&self) -> bool {
        let Some(PendingRestart { unit, dependency }) = self.pending.lock().await.take() else {
            return true;
        };

        // The install task owns the dependency until the download is done.
        let installed = dependency.lock().await.last_install_succeeded();
        if !installed {
            error!(unit = %unit.filename(), "Service binary was not installed, leaving it stopped");
            return false;
        }

        if !unit.dump().await {
            error!(unit = %unit.filename(), path = %unit.location().display(), "Unit file missing");
            return false;
        }
        unit.start().await
    }

    /// Whether a stopped service unit is waiting for a restart.
    pub async fn has_pending_restart(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Remove every installed executable, stopping and removing the service
    /// unit first.
    ///
    /// Returns the names of the removed executables.
    ///
    /// # Errors
    ///
    /// Every dependency is attempted; the first failure is returned after
    /// the others have been processed.
    pub async fn uninstall(&self) -> Result<Vec<String>> {
        let _cycle = self.cycle.lock().await;
        let mut removed = Vec::new();
        let mut first_error = None;

        for shared in &self.dependencies {
            let dependency = shared.lock().await;
            if !dependency.executable().file().exists() {
                continue;
            }

            if dependency.is_service() {
                let unit = ServiceUnit::new(
                    dependency.executable().file(),
                    &self.unit_dir,
                    Arc::clone(&self.backends.services),
                )
                .verbose(self.verbose);
                unit.stop().await;
                if unit.remove().await {
                    warn!(unit = %unit.filename(), "Unit file still present");
                }
            }

            match dependency.remove(self.backends.processes.as_ref()).await {
                Ok(true) => removed.push(dependency.name().to_string()),
                Ok(false) => {}
                Err(e) => {
                    error!(dependency = %dependency.name(), error = %format!("{e:#}"), "Uninstall failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(removed = removed.len(), "Uninstalled");
                Ok(removed)
            }
        }
    }
}

/// Wait for every install task. Failures are collected, not short-circuited.
///
/// Returns the executables that installed with every permission outcome
/// successful.
///
/// # Errors
///
/// Returns [`UpdaterError::PermissionNormalization`] naming every file that
/// failed, or the first task error.
pub async fn join_all(handles: Vec<InstallHandle>) -> Result<Vec<String>> {
    let mut installed = Vec::new();
    let mut failed_files = Vec::new();
    let mut first_error = None;

    for handle in handles {
        let executable = handle.executable().to_string();
        match handle.join().await {
            Ok(outcomes) => {
                let failed: Vec<String> =
                    outcomes.iter().filter(|o| !o.success).map(|o| o.file.clone()).collect();
                if failed.is_empty() {
                    installed.push(executable);
                } else {
                    failed_files.extend(failed);
                }
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if !failed_files.is_empty() {
        return Err(UpdaterError::PermissionNormalization {
            files: failed_files.join(", "),
        }
        .into());
    }
    Ok(installed)
}
