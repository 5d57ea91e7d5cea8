//! Updater configuration.
//!
//! Configuration is a single TOML file, by default
//! `/etc/vpnmupd/config.toml`. Its location can be overridden with the
//! `VPNMUPD_CONFIG` environment variable or `--config`. A missing file is not
//! an error: every field has a default and the default dependency list is the
//! full set of tracked components.
//!
//! # Example
//!
//! ```toml
//! install_dir = "/usr/local/bin"
//! check_interval_secs = 86400
//! listen = "127.0.0.1:3445"
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 100
//! max_delay_ms = 2000
//!
//! [[dependencies]]
//! asset = "v2ray-linux-64.zip"
//! owner = "v2fly"
//! repo = "v2ray-core"
//! executable = "v2ray"
//! data_files = ["geoip.dat", "geosite.dat"]
//!
//! [[dependencies]]
//! asset = "vpnmd"
//! owner = "anatolio-deb"
//! repo = "vpnmd"
//! executable = "vpnmd"
//! service = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_retry::strategy::ExponentialBackoff;

use crate::constants::{
    CONFIG_ENV_VAR, DEFAULT_API_BASE, DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_CONFIG_PATH,
    DEFAULT_INSTALL_DIR, DEFAULT_LISTEN_ADDR, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_STAGING_DIR, DEFAULT_UNIT_DIR, DEFAULT_USER_AGENT, MAX_BACKOFF_DELAY_MS,
    STARTING_BACKOFF_DELAY_MS,
};
use crate::core::UpdaterError;

/// Top-level updater configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdaterConfig {
    /// Where executables and their data files are installed.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Where downloaded archives are staged before extraction.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Where generated service units are written.
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// User agent sent to the release API.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Base URL of the release API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Per-request network timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Interval between scheduled checks in daemon mode.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Address of the local control API.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Locked-file retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Tracked dependencies, in install order.
    #[serde(default = "default_dependencies")]
    pub dependencies: Vec<DependencySpec>,
}

/// One tracked dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
    /// Release asset file name.
    pub asset: String,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Installed executable name. When it differs from `asset` the asset is
    /// a zip archive containing this executable.
    pub executable: String,
    /// Marks the dependency whose service is stopped around its own update.
    #[serde(default)]
    pub service: bool,
    /// Extra readable files shipped in the same archive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_files: Vec<String>,
}

impl DependencySpec {
    /// A dependency without data files.
    pub fn new(
        asset: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        executable: impl Into<String>,
    ) -> Self {
        Self {
            asset: asset.into(),
            owner: owner.into(),
            repo: repo.into(),
            executable: executable.into(),
            service: false,
            data_files: Vec::new(),
        }
    }

    /// Mark as the service dependency.
    #[must_use]
    pub const fn with_service(mut self) -> Self {
        self.service = true;
        self
    }

    /// Add data files extracted from the same archive.
    #[must_use]
    pub fn with_data_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Whether the asset is an archive rather than the bare executable.
    #[must_use]
    pub fn is_archive(&self) -> bool {
        self.asset != self.executable
    }
}

/// Bounded retry for writes to a file held by a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_delay_ms: STARTING_BACKOFF_DELAY_MS,
            max_delay_ms: MAX_BACKOFF_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts: `initial`, `2 * initial`, `4 * initial`...
    /// capped at `max_delay_ms`, one fewer than `max_attempts`.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(2)
            .factor((self.initial_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.max_attempts.saturating_sub(1))
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            staging_dir: default_staging_dir(),
            unit_dir: default_unit_dir(),
            user_agent: default_user_agent(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            listen: default_listen(),
            retry: RetryPolicy::default(),
            dependencies: default_dependencies(),
        }
    }
}

impl UpdaterConfig {
    /// Load from the default location, or the `VPNMUPD_CONFIG` override.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read, parsed or validated.
    pub async fn load() -> Result<Self> {
        Self::load_with_optional(None).await
    }

    /// Load from `path` when given, otherwise from the default location.
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read, parsed or validated.
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load_from(&path).await
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is not valid TOML or does not pass
    /// [`UpdaterConfig::validate`].
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Config file location: `VPNMUPD_CONFIG` if set, else the system default.
    #[must_use]
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV_VAR)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Check the dependency list for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::ConfigError`] on an empty name, a duplicate
    /// executable or more than one service dependency.
    pub fn validate(&self) -> Result<(), UpdaterError> {
        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            for (field, value) in [
                ("asset", &dep.asset),
                ("owner", &dep.owner),
                ("repo", &dep.repo),
                ("executable", &dep.executable),
            ] {
                if value.trim().is_empty() {
                    return Err(config_error(format!(
                        "dependency {field} must not be empty (executable '{}')",
                        dep.executable
                    )));
                }
            }
            if !seen.insert(dep.executable.as_str()) {
                return Err(config_error(format!(
                    "duplicate dependency executable '{}'",
                    dep.executable
                )));
            }
            if dep.data_files.iter().any(|f| f.trim().is_empty()) {
                return Err(config_error(format!(
                    "empty data file name for '{}'",
                    dep.executable
                )));
            }
        }

        let services: Vec<&str> = self
            .dependencies
            .iter()
            .filter(|dep| dep.service)
            .map(|dep| dep.executable.as_str())
            .collect();
        if services.len() > 1 {
            return Err(config_error(format!(
                "only one dependency may be marked service = true, found: {}",
                services.join(", ")
            )));
        }

        Ok(())
    }

    /// The service dependency, if any.
    #[must_use]
    pub fn service_dependency(&self) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|dep| dep.service)
    }
}

fn config_error(message: String) -> UpdaterError {
    UpdaterError::ConfigError {
        message,
    }
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(DEFAULT_INSTALL_DIR)
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_DIR)
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from(DEFAULT_UNIT_DIR)
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

const fn default_check_interval_secs() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN_ADDR.parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 3445)))
}

/// The tracked components.
#[must_use]
pub fn default_dependencies() -> Vec<DependencySpec> {
    vec![
        DependencySpec::new(
            "tun2socks-linux-amd64.zip",
            "xjasonlyu",
            "tun2socks",
            "tun2socks-linux-amd64",
        ),
        DependencySpec::new("v2ray-linux-64.zip", "v2fly", "v2ray-core", "v2ray")
            .with_data_files(["geoip.dat", "geosite.dat"]),
        DependencySpec::new(
            "cloudflared-linux-amd64",
            "cloudflare",
            "cloudflared",
            "cloudflared-linux-amd64",
        ),
        DependencySpec::new("vpnmd", "anatolio-deb", "vpnmd", "vpnmd").with_service(),
        DependencySpec::new("vpnm", "anatolio-deb", "vpnm", "vpnm"),
    ]
}
