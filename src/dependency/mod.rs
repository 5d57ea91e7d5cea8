//! One tracked dependency: a remote release bound to a local executable.
//!
//! [`Dependency::check`] recomputes the `updatable` flag from the installed
//! and the latest released version. [`Dependency::download`] fetches the
//! resolved asset and installs it, either directly over the executable or
//! through an [`ArchiveBundle`] when the release ships a zip.
//!
//! Writing over a binary that is currently running fails with
//! `ExecutableFileBusy`. Those failures go through [`retry_on_lock`], which
//! terminates the holder by name and retries with exponential backoff until
//! the configured attempt ceiling is reached.

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::archive::ArchiveBundle;
use crate::config::{DependencySpec, RetryPolicy, UpdaterConfig};
use crate::core::UpdaterError;
use crate::files::{Executable, LocalFile, Outcome};
use crate::process::ProcessControl;
use crate::release::{ReleaseDescriptor, ReleaseSource};
use crate::utils::ProgressBar;
use crate::version::Version;

/// Serializable snapshot of a dependency's last check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    /// Installed executable name
    pub executable: String,
    /// Release asset name
    pub asset: String,
    /// Version text reported by the installed executable
    pub local_version: Option<String>,
    /// Version text of the latest release tag
    pub remote_version: Option<String>,
    /// Whether the last check found an update
    pub updatable: bool,
    /// Size of the last download
    pub content_length: Option<u64>,
}

/// A tracked dependency and the state of its last check and install.
#[derive(Debug, Clone)]
pub struct Dependency {
    release: ReleaseDescriptor,
    executable: Executable,
    archive: Option<ArchiveBundle>,
    service: bool,
    updatable: bool,
    local_version: Option<Version>,
    remote_version: Option<Version>,
    content_length: Option<u64>,
    outcomes: Vec<Outcome>,
    installed: bool,
    retry: RetryPolicy,
}

impl Dependency {
    /// Build a dependency from its configuration entry.
    #[must_use]
    pub fn new(spec: &DependencySpec, config: &UpdaterConfig) -> Self {
        let executable = Executable::new(&config.install_dir, &spec.executable);

        let archive = spec.is_archive().then(|| {
            let mut extractables = vec![executable.file().clone()];
            extractables.extend(
                spec.data_files.iter().map(|name| LocalFile::data(&config.install_dir, name)),
            );
            ArchiveBundle::new(LocalFile::data(&config.staging_dir, &spec.asset), extractables)
        });

        Self {
            release: ReleaseDescriptor::new(&spec.asset, &spec.owner, &spec.repo),
            executable,
            archive,
            service: spec.service,
            updatable: false,
            local_version: None,
            remote_version: None,
            content_length: None,
            outcomes: Vec::new(),
            installed: false,
            retry: config.retry,
        }
    }

    /// Installed executable name, which also names the dependency.
    #[must_use]
    pub fn name(&self) -> &str {
        self.executable.filename()
    }

    /// The release this dependency tracks.
    #[must_use]
    pub const fn release(&self) -> &ReleaseDescriptor {
        &self.release
    }

    /// The installed executable.
    #[must_use]
    pub const fn executable(&self) -> &Executable {
        &self.executable
    }

    /// The archive the release ships, if it is not a bare binary.
    #[must_use]
    pub const fn archive(&self) -> Option<&ArchiveBundle> {
        self.archive.as_ref()
    }

    /// Whether this dependency runs as the managed service.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        self.service
    }

    /// Result of the last check.
    #[must_use]
    pub const fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Installed version found by the last check.
    #[must_use]
    pub const fn local_version(&self) -> Option<Version> {
        self.local_version
    }

    /// Released version found by the last check.
    #[must_use]
    pub const fn remote_version(&self) -> Option<Version> {
        self.remote_version
    }

    /// Announced size of the last download.
    #[must_use]
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Permission outcomes of the last install.
    #[must_use]
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Outcomes of the last install that did not succeed.
    #[must_use]
    pub fn failed_outcomes(&self) -> Vec<&Outcome> {
        self.outcomes.iter().filter(|outcome| !outcome.success).collect()
    }

    /// Whether the last download finished and every outcome succeeded.
    #[must_use]
    pub fn last_install_succeeded(&self) -> bool {
        self.installed && self.outcomes.iter().all(|outcome| outcome.success)
    }

    /// Snapshot of the last check.
    #[must_use]
    pub fn status(&self) -> DependencyStatus {
        let non_empty = |text: &str| (!text.is_empty()).then(|| text.to_string());
        DependencyStatus {
            executable: self.name().to_string(),
            asset: self.release.asset().to_string(),
            local_version: non_empty(self.executable.reported_version()),
            remote_version: non_empty(self.release.version_text()),
            updatable: self.updatable,
            content_length: self.content_length,
        }
    }

    /// Recompute `updatable` from the installed and the released version.
    ///
    /// The flag is set when the installed version is unknown, or when the
    /// released version is known, of the same kind and strictly newer.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LookupFailed`] when the release lookup fails.
    /// The flag is still updated first, treating the remote as unknown.
    pub async fn check(
        &mut self,
        source: &dyn ReleaseSource,
        processes: &dyn ProcessControl,
    ) -> Result<bool> {
        self.local_version = self.executable.detect_version(processes).await;
        let resolved = self.release.resolve(source).await;
        self.remote_version = resolved.as_ref().ok().copied().flatten();
        self.updatable = needs_update(self.local_version, self.remote_version);

        debug!(
            dependency = %self.name(),
            local = ?self.local_version,
            remote = ?self.remote_version,
            updatable = self.updatable,
            "Checked dependency"
        );

        resolved?;
        Ok(self.updatable)
    }

    /// Download the resolved asset and install it.
    ///
    /// Outcomes of a previous install are replaced.
    ///
    /// # Errors
    ///
    /// - [`UpdaterError::MissingDownloadUrl`] when the release is unresolved
    /// - [`UpdaterError::TransportFailed`] when the download fails
    /// - [`UpdaterError::LockedResource`] when a target stays busy
    /// - [`UpdaterError::ArchiveFailed`] when the downloaded zip is unreadable
    /// - any other I/O error while writing or extracting
    pub async fn download(
        &mut self,
        source: &dyn ReleaseSource,
        processes: &dyn ProcessControl,
        progress: &ProgressBar,
    ) -> Result<Vec<Outcome>> {
        self.download_with(source, processes, progress, &write_file).await
    }

    async fn download_with(
        &mut self,
        source: &dyn ReleaseSource,
        processes: &dyn ProcessControl,
        progress: &ProgressBar,
        write: &WriteFile<'_>,
    ) -> Result<Vec<Outcome>> {
        self.installed = false;
        let url = self
            .release
            .download_url()
            .ok_or_else(|| UpdaterError::MissingDownloadUrl {
                asset: self.release.asset().to_string(),
            })?
            .to_string();

        self.outcomes.clear();
        progress.set_message(self.release.version_text().to_string());

        let payload = source.fetch(&url, progress).await?;
        self.content_length = payload.content_length.or(Some(payload.bytes.len() as u64));

        // Busy targets are released by terminating the installed executable.
        let holder = self.executable.filename();
        let outcomes = match &self.archive {
            Some(bundle) => {
                let staged = bundle.location();
                retry_on_lock(&self.retry, &staged, holder, processes, || {
                    write(staged.as_path(), payload.bytes.as_slice())
                })
                .await?;

                retry_on_lock(&self.retry, &self.executable.location(), holder, processes, || {
                    bundle.extract()
                })
                .await
                .map_err(|e| archive_error(e, &staged))?
            }
            None => {
                let target = self.executable.location();
                retry_on_lock(&self.retry, &target, holder, processes, || {
                    write(target.as_path(), payload.bytes.as_slice())
                })
                .await?;

                vec![self.executable.file().normalize_permissions().await]
            }
        };

        progress.finish_with_message(format!("{} installed", self.release.version_text()));
        info!(
            dependency = %self.name(),
            version = %self.release.version_text(),
            failed = outcomes.iter().filter(|o| !o.success).count(),
            "Installed dependency"
        );

        self.installed = true;
        self.outcomes = outcomes.clone();
        Ok(outcomes)
    }

    /// Delete the installed executable.
    ///
    /// Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Fails when the file stays busy or cannot be removed.
    pub async fn remove(&self, processes: &dyn ProcessControl) -> Result<bool> {
        let target = self.executable.location();
        if !target.exists() {
            return Ok(false);
        }

        retry_on_lock(&self.retry, &target, self.executable.filename(), processes, || {
            tokio::fs::remove_file(&target)
        })
        .await?;

        info!(dependency = %self.name(), "Removed executable");
        Ok(true)
    }
}

/// Whether the installed version should be replaced.
#[must_use]
pub fn needs_update(local: Option<Version>, remote: Option<Version>) -> bool {
    match (local, remote) {
        (None, _) => true,
        (Some(local), Some(remote)) => remote.is_newer_than(&local),
        (Some(_), None) => false,
    }
}

type WriteFile<'w> = dyn for<'a> Fn(&'a Path, &'a [u8]) -> BoxFuture<'a, io::Result<()>> + Send + Sync + 'w;

fn write_file<'a>(path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
    Box::pin(tokio::fs::write(path, bytes))
}

/// Report an unreadable archive as [`UpdaterError::ArchiveFailed`].
fn archive_error(error: anyhow::Error, archive: &Path) -> anyhow::Error {
    let reason = match error.downcast_ref::<io::Error>() {
        Some(io_error) if io_error.kind() == io::ErrorKind::InvalidData => io_error.to_string(),
        _ => return error,
    };
    error.context(UpdaterError::ArchiveFailed {
        path: archive.display().to_string(),
        reason,
    })
}

fn is_locked(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::ExecutableFileBusy | io::ErrorKind::ResourceBusy)
}

/// Run `operation` on `path`, terminating processes named `holder` and
/// retrying while the path is busy.
///
/// Other errors fail immediately.
///
/// # Errors
///
/// Returns [`UpdaterError::LockedResource`] once `policy.max_attempts` is
/// reached, or the first non-lock I/O error with `path` as context.
pub async fn retry_on_lock<T, F, Fut>(
    policy: &RetryPolicy,
    path: &Path,
    holder: &str,
    processes: &dyn ProcessControl,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let attempts = AtomicUsize::new(0);

    let result = RetryIf::spawn(
        policy.backoff(),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let pending = operation();
            async move {
                if attempt > 0 {
                    if let Err(e) = processes.terminate(holder).await {
                        warn!(process = %holder, error = %e, "Failed to terminate file holder");
                    }
                }
                pending.await
            }
        },
        |e: &io::Error| {
            let locked = is_locked(e);
            if locked {
                debug!(path = %path.display(), holder, "Target busy, will retry");
            }
            locked
        },
    )
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(e) if is_locked(&e) => Err(UpdaterError::LockedResource {
            path: path.display().to_string(),
            attempts: attempts.load(Ordering::SeqCst),
        }
        .into()),
        Err(e) => Err(anyhow::Error::new(e).context(UpdaterError::FileSystemError {
            operation: "install".to_string(),
            path: path.display().to_string(),
        })),
    }
}
