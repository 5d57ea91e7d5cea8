//! Installed files: executables and the data files shipped next to them.
//!
//! A [`LocalFile`] is a plain value: a container directory, a file name and a
//! [`FileKind`] that decides how permissions are normalized after the file is
//! written. [`Executable`] adds the version the installed binary reports
//! about itself.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::process::ProcessControl;
use crate::version::{self, Version};

/// How a file's permissions are normalized after installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Readable by everyone (`ugo+r`).
    Data,
    /// Executable by everyone (`ugo+x`).
    Executable,
}

impl FileKind {
    /// Permission bits added by normalization.
    #[must_use]
    pub const fn mode_bits(self) -> u32 {
        match self {
            Self::Data => 0o444,
            Self::Executable => 0o111,
        }
    }
}

/// Result of normalizing one file's permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// File name that was normalized
    pub file: String,
    /// Whether the permission change succeeded
    pub success: bool,
    /// Failure detail, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Outcome {
    fn succeeded(file: &str) -> Self {
        Self {
            file: file.to_string(),
            success: true,
            detail: None,
        }
    }

    fn failed(file: &str, detail: impl Into<String>) -> Self {
        Self {
            file: file.to_string(),
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// A file at `container/filename`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    filename: String,
    container: PathBuf,
    kind: FileKind,
}

impl LocalFile {
    /// A file made readable after installation.
    pub fn data(container: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self::new(container, filename, FileKind::Data)
    }

    /// A file made executable after installation.
    pub fn executable(container: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self::new(container, filename, FileKind::Executable)
    }

    /// A file of the given kind.
    pub fn new(container: impl Into<PathBuf>, filename: impl Into<String>, kind: FileKind) -> Self {
        Self {
            filename: filename.into(),
            container: container.into(),
            kind,
        }
    }

    /// The bare file name.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The directory holding the file.
    #[must_use]
    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Full path of the file.
    #[must_use]
    pub fn location(&self) -> PathBuf {
        self.container.join(&self.filename)
    }

    /// How this file's permissions are normalized.
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        self.kind
    }

    /// Whether the file currently exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.location().exists()
    }

    /// Add the kind's permission bits to the file.
    ///
    /// Failures are reported in the returned [`Outcome`] rather than raised so
    /// the caller can inspect every file of an install at once.
    pub async fn normalize_permissions(&self) -> Outcome {
        let location = self.location();
        match add_mode_bits(&location, self.kind.mode_bits()).await {
            Ok(()) => {
                debug!(file = %location.display(), kind = ?self.kind, "Normalized permissions");
                Outcome::succeeded(&self.filename)
            }
            Err(e) => {
                warn!(file = %location.display(), error = %e, "Failed to normalize permissions");
                Outcome::failed(&self.filename, e.to_string())
            }
        }
    }
}

#[cfg(unix)]
async fn add_mode_bits(path: &Path, bits: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | bits);
    tokio::fs::set_permissions(path, permissions).await
}

#[cfg(not(unix))]
async fn add_mode_bits(path: &Path, _bits: u32) -> std::io::Result<()> {
    tokio::fs::metadata(path).await.map(|_| ())
}

/// An installed executable and the version it last reported.
#[derive(Debug, Clone)]
pub struct Executable {
    file: LocalFile,
    reported: String,
}

impl Executable {
    /// An executable at `container/filename`.
    pub fn new(container: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            file: LocalFile::executable(container, filename),
            reported: String::new(),
        }
    }

    /// The underlying file.
    #[must_use]
    pub const fn file(&self) -> &LocalFile {
        &self.file
    }

    /// The bare file name.
    #[must_use]
    pub fn filename(&self) -> &str {
        self.file.filename()
    }

    /// Full path of the executable.
    #[must_use]
    pub fn location(&self) -> PathBuf {
        self.file.location()
    }

    /// The version text extracted from the last self-report, empty when
    /// unknown.
    #[must_use]
    pub fn reported_version(&self) -> &str {
        &self.reported
    }

    /// Ask the installed binary for its version.
    ///
    /// A missing file, a failed invocation or output without a parseable
    /// version all yield `None`.
    pub async fn detect_version(&mut self, processes: &dyn ProcessControl) -> Option<Version> {
        self.reported.clear();

        let location = self.location();
        if !location.exists() {
            debug!(executable = %self.filename(), "Executable not installed");
            return None;
        }

        let output = match processes.self_report(&location).await {
            Ok(output) => output,
            Err(e) => {
                debug!(executable = %self.filename(), error = %e, "Self-report failed");
                return None;
            }
        };

        self.reported = version::extract(&output).to_string();
        version::power(&self.reported).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeProcesses;
    use tempfile::TempDir;

    #[test]
    fn test_location_joins_container_and_name() {
        let file = LocalFile::data("/usr/local/bin", "geoip.dat");
        assert_eq!(file.location(), PathBuf::from("/usr/local/bin/geoip.dat"));
        assert_eq!(file.kind(), FileKind::Data);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_normalize_executable_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let file = LocalFile::executable(temp.path(), "tool");
        std::fs::write(file.location(), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(file.location(), std::fs::Permissions::from_mode(0o600)).unwrap();

        let outcome = file.normalize_permissions().await;
        assert!(outcome.success);

        let mode = std::fs::metadata(file.location()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o711);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_normalize_data_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let file = LocalFile::data(temp.path(), "geosite.dat");
        std::fs::write(file.location(), b"data").unwrap();
        std::fs::set_permissions(file.location(), std::fs::Permissions::from_mode(0o600)).unwrap();

        assert!(file.normalize_permissions().await.success);

        let mode = std::fs::metadata(file.location()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_normalize_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let file = LocalFile::data(temp.path(), "missing.dat");

        let outcome = file.normalize_permissions().await;
        assert!(!outcome.success);
        assert_eq!(outcome.file, "missing.dat");
        assert!(outcome.detail.is_some());
    }

    #[tokio::test]
    async fn test_detect_version_missing_executable() {
        let temp = TempDir::new().unwrap();
        let mut exe = Executable::new(temp.path(), "vpnm");
        let processes = FakeProcesses::default();

        assert_eq!(exe.detect_version(&processes).await, None);
        assert_eq!(exe.reported_version(), "");
    }

    #[tokio::test]
    async fn test_detect_version_parses_self_report() {
        let temp = TempDir::new().unwrap();
        let mut exe = Executable::new(temp.path(), "vpnm");
        std::fs::write(exe.location(), b"binary").unwrap();

        let processes = FakeProcesses::default().with_report("vpnm", "vpnm version 0.3.1\n");
        assert_eq!(exe.detect_version(&processes).await, Some(Version::Ordinal(31)));
        assert_eq!(exe.reported_version(), "0.3.1");
    }

    #[tokio::test]
    async fn test_detect_version_failed_invocation_is_unknown() {
        let temp = TempDir::new().unwrap();
        let mut exe = Executable::new(temp.path(), "vpnm");
        std::fs::write(exe.location(), b"binary").unwrap();

        // No report registered: the fake fails the invocation.
        let processes = FakeProcesses::default();
        assert_eq!(exe.detect_version(&processes).await, None);
    }
}
