//! Zip archives shipped by releases that are not a bare binary.
//!
//! An [`ArchiveBundle`] is the staged archive plus the files it is expected
//! to contain. Extraction matches member names exactly against the
//! registered extractables and writes each match straight to its own
//! container directory; everything else in the archive is left alone.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::files::{LocalFile, Outcome};

/// A downloaded archive and the files to pull out of it.
#[derive(Debug, Clone)]
pub struct ArchiveBundle {
    file: LocalFile,
    extractables: Vec<LocalFile>,
}

impl ArchiveBundle {
    /// A bundle stored at `file` holding `extractables`, in order.
    #[must_use]
    pub const fn new(file: LocalFile, extractables: Vec<LocalFile>) -> Self {
        Self { file, extractables }
    }

    /// The staged archive file.
    #[must_use]
    pub const fn file(&self) -> &LocalFile {
        &self.file
    }

    /// Where the archive is staged.
    #[must_use]
    pub fn location(&self) -> PathBuf {
        self.file.location()
    }

    /// Files expected inside the archive.
    #[must_use]
    pub fn extractables(&self) -> &[LocalFile] {
        &self.extractables
    }

    /// Extract every registered member and normalize its permissions.
    ///
    /// Returns one [`Outcome`] per extracted member, in registration order.
    /// Extractables the archive does not contain are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the archive cannot be read or a
    /// target cannot be written. A target held by a running process surfaces
    /// as [`io::ErrorKind::ExecutableFileBusy`] so callers can retry.
    pub async fn extract(&self) -> io::Result<Vec<Outcome>> {
        let archive = self.location();
        let targets: Vec<(String, PathBuf)> = self
            .extractables
            .iter()
            .map(|file| (file.filename().to_string(), file.location()))
            .collect();

        let extracted = tokio::task::spawn_blocking(move || extract_members(&archive, &targets))
            .await
            .map_err(io::Error::other)??;

        let mut outcomes = Vec::with_capacity(self.extractables.len());
        for (index, file) in self.extractables.iter().enumerate() {
            if extracted.contains(&index) {
                outcomes.push(file.normalize_permissions().await);
            } else {
                warn!(archive = %self.file.filename(), member = %file.filename(), "Member missing from archive");
            }
        }
        Ok(outcomes)
    }
}

/// Write each member named in `targets` to its paired path. Returns the
/// indices of the targets that were written.
fn extract_members(archive: &Path, targets: &[(String, PathBuf)]) -> io::Result<HashSet<usize>> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(zip_to_io)?;
    let mut extracted = HashSet::new();

    for i in 0..zip.len() {
        let mut member = zip.by_index(i).map_err(zip_to_io)?;
        if member.is_dir() {
            continue;
        }

        let Some(index) = targets.iter().position(|(name, _)| name == member.name()) else {
            continue;
        };
        // First match wins when an archive repeats a name.
        if !extracted.insert(index) {
            continue;
        }

        let target = &targets[index].1;
        let mut out = File::create(target)?;
        let written = io::copy(&mut member, &mut out)?;
        debug!(member = %targets[index].0, target = %target.display(), bytes = written, "Extracted member");
    }

    Ok(extracted)
}

fn zip_to_io(error: zip::result::ZipError) -> io::Error {
    match error {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_zip;
    use tempfile::TempDir;

    fn bundle(temp: &TempDir) -> ArchiveBundle {
        let staging = temp.path().join("staging");
        let install = temp.path().join("bin");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&install).unwrap();

        ArchiveBundle::new(
            LocalFile::data(&staging, "v2ray-linux-64.zip"),
            vec![
                LocalFile::executable(&install, "v2ray"),
                LocalFile::data(&install, "geoip.dat"),
                LocalFile::data(&install, "geosite.dat"),
            ],
        )
    }

    #[tokio::test]
    async fn test_extract_only_registered_members() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle(&temp);
        write_zip(
            &bundle.location(),
            &[
                ("v2ray", b"binary".as_slice()),
                ("geoip.dat", b"ip"),
                ("geosite.dat", b"site"),
                ("config.json", b"{}"),
                ("systemd/system/v2ray.service", b"[Unit]"),
            ],
        )
        .unwrap();

        let outcomes = bundle.extract().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(
            outcomes.iter().map(|o| o.file.as_str()).collect::<Vec<_>>(),
            ["v2ray", "geoip.dat", "geosite.dat"]
        );

        let install = temp.path().join("bin");
        assert_eq!(std::fs::read(install.join("v2ray")).unwrap(), b"binary");
        assert_eq!(std::fs::read(install.join("geosite.dat")).unwrap(), b"site");
        assert!(!install.join("config.json").exists());
        assert!(!install.join("v2ray.service").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_normalizes_by_kind() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let bundle = bundle(&temp);
        write_zip(
            &bundle.location(),
            &[("v2ray", b"binary".as_slice()), ("geoip.dat", b"ip"), ("geosite.dat", b"site")],
        )
        .unwrap();

        bundle.extract().await.unwrap();

        let install = temp.path().join("bin");
        let exe = std::fs::metadata(install.join("v2ray")).unwrap().permissions().mode();
        let data = std::fs::metadata(install.join("geoip.dat")).unwrap().permissions().mode();
        assert_eq!(exe & 0o111, 0o111);
        assert_eq!(data & 0o444, 0o444);
    }

    #[tokio::test]
    async fn test_missing_member_is_skipped() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle(&temp);
        write_zip(&bundle.location(), &[("v2ray", b"binary".as_slice()), ("geoip.dat", b"ip")])
            .unwrap();

        let outcomes = bundle.extract().await.unwrap();
        assert_eq!(outcomes.iter().map(|o| o.file.as_str()).collect::<Vec<_>>(), ["v2ray", "geoip.dat"]);
        assert!(outcomes.iter().all(|o| o.success));
        assert!(!temp.path().join("bin").join("geosite.dat").exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_invalid_data() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle(&temp);
        std::fs::write(bundle.location(), b"not a zip").unwrap();

        let err = bundle.extract().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_missing_archive_is_not_found() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle(&temp);

        let err = bundle.extract().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
