//! Command-line interface for vpnmupd.
//!
//! The binary has three modes, selected by flags rather than subcommands:
//!
//! | Invocation | Mode |
//! |---|---|
//! | `vpnmupd --update [--force]` | Check, install updates, wait, restart the managed service, register the updater as a service |
//! | `vpnmupd --uninstall` | Stop the managed service and remove every installed executable |
//! | `vpnmupd` | Daemon: daily checks plus the local control API |
//!
//! # Examples
//!
//! ```bash
//! # First install or manual update
//! sudo vpnmupd --update
//!
//! # Reinstall everything regardless of versions
//! sudo vpnmupd --update --force --verbose
//!
//! # Use a custom configuration
//! vpnmupd --config ./vpnmupd.toml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::UpdaterConfig;
use crate::constants::CONFIG_ENV_VAR;
use crate::core::UpdaterError;
use crate::installer::{Backends, Orchestrator, join_all};
use crate::service::ServiceUnit;
use crate::utils::MultiProgress;
use crate::{scheduler, server};

/// Name of the updater's own service unit.
const SELF_UNIT_NAME: &str = "vpnmupd";

/// An update daemon for vpnm.
#[derive(Parser, Debug)]
#[command(
    name = "vpnmupd",
    about = "An update daemon for vpnm",
    version,
    long_about = "Keeps vpnm, vpnmd and their companion executables up to date. \
                  Without --update or --uninstall it runs as a daemon that checks \
                  for releases daily and serves a local control API."
)]
pub struct Cli {
    /// Install vpnm or update an existing installation.
    #[arg(long, conflicts_with = "uninstall")]
    update: bool,

    /// Uninstall vpnm and its dependencies.
    #[arg(long)]
    uninstall: bool,

    /// Reinstall every dependency, even those already up to date.
    #[arg(long, requires = "update")]
    force: bool,

    /// Enable debug output.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file.
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Disable progress bars.
    #[arg(long)]
    no_progress: bool,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Install or update, then register the updater as a service.
    Update {
        /// Install regardless of the updatable flag
        force: bool,
    },
    /// Remove everything that was installed.
    Uninstall,
    /// Scheduled checks plus the control API.
    Daemon,
}

impl Cli {
    /// The selected mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        if self.update {
            Mode::Update {
                force: self.force,
            }
        } else if self.uninstall {
            Mode::Uninstall
        } else {
            Mode::Daemon
        }
    }

    /// Set up logging, load the configuration and run the selected mode
    /// against the real system.
    ///
    /// # Errors
    ///
    /// Fails when configuration cannot be loaded or the mode fails.
    pub async fn execute(self) -> Result<()> {
        init_logging(self.verbose);

        let config = UpdaterConfig::load_with_optional(self.config.clone()).await?;
        let backends = Backends::system(&config, self.verbose)?;
        self.execute_with(config, backends).await
    }

    /// Run the selected mode with the given configuration and backends.
    ///
    /// # Errors
    ///
    /// - update: any failed install, failed permission outcome, or a service
    ///   unit that is missing or not active afterwards
    /// - uninstall: an executable that could not be removed
    /// - daemon: the control API failing to bind
    pub async fn execute_with(self, config: UpdaterConfig, backends: Backends) -> Result<()> {
        let progress = if self.no_progress || matches!(self.mode(), Mode::Daemon) {
            MultiProgress::disabled()
        } else {
            MultiProgress::new()
        };
        let orchestrator =
            Orchestrator::new(&config, backends.clone()).with_progress(progress).verbose(self.verbose);

        match self.mode() {
            Mode::Update {
                force,
            } => update(&orchestrator, &config, &backends, force).await,
            Mode::Uninstall => uninstall(&orchestrator).await,
            Mode::Daemon => daemon(Arc::new(orchestrator), &config).await,
        }
    }
}

async fn update(
    orchestrator: &Orchestrator,
    config: &UpdaterConfig,
    backends: &Backends,
    force: bool,
) -> Result<()> {
    let report = orchestrator.check_all().await;
    for failure in &report.failures {
        println!("{} {}: {}", "⚠".yellow(), failure.executable, failure.reason);
    }

    let joined = join_all(orchestrator.install_updatable(force).await).await;

    // A failed sibling must not leave the managed service stopped.
    let restarted =
        !orchestrator.has_pending_restart().await || orchestrator.restart_service().await;

    let installed = joined?;
    if installed.is_empty() {
        println!("{} Everything is up to date", "✓".green());
    }
    for name in &installed {
        println!("{} Installed {}", "✓".green(), name.bold());
    }

    if !restarted {
        let unit = config
            .service_dependency()
            .map_or_else(String::new, |dep| format!("{}.service", dep.executable));
        return Err(UpdaterError::ServiceNotStarted {
            unit,
        }
        .into());
    }

    register_self(config, backends).await
}

/// Generate, write and start the updater's own unit.
async fn register_self(config: &UpdaterConfig, backends: &Backends) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    let unit = ServiceUnit::with_command(
        SELF_UNIT_NAME,
        &exe.display().to_string(),
        &config.unit_dir,
        Arc::clone(&backends.services),
    );

    if !unit.dump().await {
        return Err(UpdaterError::ServiceFileMissing {
            path: unit.location().display().to_string(),
        }
        .into());
    }
    if !unit.start().await {
        return Err(UpdaterError::ServiceNotStarted {
            unit: unit.filename().to_string(),
        }
        .into());
    }

    info!(unit = %unit.filename(), "Updater registered as a service");
    println!("{} {} is running", "✓".green(), unit.filename().bold());
    Ok(())
}

async fn uninstall(orchestrator: &Orchestrator) -> Result<()> {
    let removed = orchestrator.uninstall().await?;
    if removed.is_empty() {
        println!("Nothing to uninstall");
    }
    for name in &removed {
        println!("{} Removed {}", "✓".green(), name.bold());
    }
    Ok(())
}

async fn daemon(orchestrator: Arc<Orchestrator>, config: &UpdaterConfig) -> Result<()> {
    let interval = Duration::from_secs(config.check_interval_secs.max(1));
    let checks = tokio::spawn(scheduler::run_daily(Arc::clone(&orchestrator), interval));

    let served = server::serve(orchestrator, config.listen).await;
    checks.abort();
    if let Err(e) = &served {
        warn!(error = %format!("{e:#}"), "Control API stopped");
    }
    served
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DependencySpec;
    use crate::service::ServiceManager;
    use crate::test_utils::{FakeProcesses, FakeReleaseSource, FakeServiceManager, TestEnvironment};

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("vpnmupd").chain(args.iter().copied()))
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(parse(&[]).unwrap().mode(), Mode::Daemon);
        assert_eq!(parse(&["--update"]).unwrap().mode(), Mode::Update { force: false });
        assert_eq!(parse(&["--update", "--force"]).unwrap().mode(), Mode::Update { force: true });
        assert_eq!(parse(&["--uninstall", "-v"]).unwrap().mode(), Mode::Uninstall);
    }

    #[test]
    fn test_conflicting_flags() {
        assert!(parse(&["--update", "--uninstall"]).is_err());
        assert!(parse(&["--force"]).is_err());
    }

    #[test]
    fn test_config_path() {
        let cli = parse(&["--config", "/tmp/vpnmupd.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/vpnmupd.toml")));
    }

    fn fakes(services: &FakeServiceManager) -> Backends {
        let releases = FakeReleaseSource::default()
            .with_release("anatolio-deb", "vpnmd", "v0.5.0", &[("vpnmd", "https://dl/vpnmd")])
            .with_release("anatolio-deb", "vpnm", "v0.4.0", &[("vpnm", "https://dl/vpnm")])
            .with_body("https://dl/vpnmd", b"vpnmd")
            .with_body("https://dl/vpnm", b"vpnm");
        Backends {
            releases: Arc::new(releases),
            processes: Arc::new(FakeProcesses::default()),
            services: Arc::new(services.clone()),
        }
    }

    fn env() -> TestEnvironment {
        TestEnvironment::new(vec![
            DependencySpec::new("vpnmd", "anatolio-deb", "vpnmd", "vpnmd").with_service(),
            DependencySpec::new("vpnm", "anatolio-deb", "vpnm", "vpnm"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_installs_and_registers_services() {
        let env = env();
        let services = FakeServiceManager::default();
        let cli = parse(&["--update", "--no-progress"]).unwrap();

        cli.execute_with(env.config.clone(), fakes(&services)).await.unwrap();

        assert!(env.installed("vpnmd").exists());
        assert!(env.installed("vpnm").exists());
        assert!(services.is_active("vpnmd.service").await);
        assert!(services.is_active("vpnmupd.service").await);

        let unit = std::fs::read_to_string(env.unit("vpnmupd")).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert!(unit.contains(&format!("ExecStart={}", exe.display())));
    }

    #[tokio::test]
    async fn test_update_fails_loudly_when_service_does_not_start() {
        let env = env();
        let services = FakeServiceManager::default().failing_start();
        let cli = parse(&["--update", "--no-progress"]).unwrap();

        let err = cli.execute_with(env.config.clone(), fakes(&services)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ServiceNotStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_restarts_service_when_sibling_fails() {
        let env = env();
        let services = FakeServiceManager::default().with_active("vpnmd.service");
        let releases = FakeReleaseSource::default()
            .with_release("anatolio-deb", "vpnmd", "v0.5.0", &[("vpnmd", "https://dl/vpnmd")])
            .with_release("anatolio-deb", "vpnm", "v0.4.0", &[("vpnm", "https://dl/vpnm")])
            .with_body("https://dl/vpnmd", b"vpnmd");
        let backends = Backends {
            releases: Arc::new(releases),
            processes: Arc::new(FakeProcesses::default()),
            services: Arc::new(services.clone()),
        };
        let cli = parse(&["--update", "--no-progress"]).unwrap();

        let err = cli.execute_with(env.config.clone(), backends).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::TransportFailed { .. })
        ));
        assert!(env.installed("vpnmd").exists());
        assert!(!env.installed("vpnm").exists());
        assert!(services.is_active("vpnmd.service").await);
        // The updater does not register itself after a failed update.
        assert!(!services.is_active("vpnmupd.service").await);
    }

    #[tokio::test]
    async fn test_update_fails_when_unit_cannot_be_written() {
        let mut env = env();
        env.config.unit_dir = env.temp_dir.path().join("missing");
        let services = FakeServiceManager::default();
        let cli = parse(&["--update", "--no-progress"]).unwrap();

        let err = cli.execute_with(env.config.clone(), fakes(&services)).await.unwrap_err();
        assert!(err.downcast_ref::<UpdaterError>().is_some());
    }

    #[tokio::test]
    async fn test_uninstall_mode() {
        let env = env();
        env.install("vpnm", b"bin").unwrap();
        let services = FakeServiceManager::default();
        let cli = parse(&["--uninstall"]).unwrap();

        cli.execute_with(env.config.clone(), fakes(&services)).await.unwrap();
        assert!(!env.installed("vpnm").exists());
    }
}
