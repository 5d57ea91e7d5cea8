//! Process control: asking installed binaries for their version and
//! terminating whatever holds a file we need to replace.
//!
//! [`ProcessControl`] is the seam between the updater and the OS. Production
//! code uses [`SystemProcesses`], which shells out to the executable itself
//! and to `pkill`; tests substitute an in-memory fake.

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::constants::{SELF_REPORT_FLAG, SELF_REPORT_TIMEOUT, SYSTEM_COMMAND_TIMEOUT};

/// OS process operations the updater depends on.
pub trait ProcessControl: Send + Sync {
    /// Run `executable --version` and return its standard output.
    fn self_report<'a>(&'a self, executable: &'a Path) -> BoxFuture<'a, Result<String>>;

    /// Terminate every process named `name`.
    fn terminate<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// [`ProcessControl`] backed by real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemProcesses {
    verbose: bool,
}

impl SystemProcesses {
    /// Create a new instance; `verbose` logs command output.
    #[must_use]
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProcessControl for SystemProcesses {
    fn self_report<'a>(&'a self, executable: &'a Path) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let output = tokio::time::timeout(
                SELF_REPORT_TIMEOUT,
                Command::new(executable).arg(SELF_REPORT_FLAG).kill_on_drop(true).output(),
            )
            .await
            .with_context(|| format!("{} did not report its version in time", executable.display()))?
            .with_context(|| format!("Failed to run {}", executable.display()))?;

            if !output.status.success() {
                bail!("{} {SELF_REPORT_FLAG} exited with {}", executable.display(), output.status);
            }

            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }

    fn terminate<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!(process = %name, "Terminating processes holding file");

            let output = tokio::time::timeout(
                SYSTEM_COMMAND_TIMEOUT,
                Command::new("pkill").arg(name).kill_on_drop(true).output(),
            )
            .await
            .with_context(|| format!("pkill {name} timed out"))?
            .context("Failed to run pkill")?;

            if self.verbose && !output.stdout.is_empty() {
                debug!("{}", String::from_utf8_lossy(&output.stdout).trim_end());
            }

            // Exit status 1 means nothing matched, which is fine: the holder
            // may already be gone.
            match output.status.code() {
                Some(0 | 1) => Ok(()),
                _ => bail!(
                    "pkill {name} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim_end()
                ),
            }
        })
    }
}
