//! Global constants used throughout the updater.
//!
//! Default locations, timeouts and retry parameters live here so the magic
//! numbers used by several modules stay discoverable in one place.

use std::time::Duration;

/// Default location of the updater configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpnmupd/config.toml";

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV_VAR: &str = "VPNMUPD_CONFIG";

/// Environment variable that disables progress bars when set.
pub const NO_PROGRESS_ENV_VAR: &str = "VPNMUPD_NO_PROGRESS";

/// Directory holding installed executables and their data files.
pub const DEFAULT_INSTALL_DIR: &str = "/usr/local/bin";

/// Directory where downloaded archives are staged before extraction.
pub const DEFAULT_STAGING_DIR: &str = "/tmp";

/// Directory holding generated systemd unit files.
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Base URL of the release listing API.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// User agent sent with every release request. The provider rejects
/// requests without one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Address of the local control API.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3445";

/// Per-request network timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// How often the daemon checks for new releases (24 hours).
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 86_400;

/// Flag passed to a local executable to make it print its version.
pub const SELF_REPORT_FLAG: &str = "--version";

/// Upper bound on how long a local executable may take to report its version.
pub const SELF_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single `systemctl` or `pkill` invocation.
pub const SYSTEM_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts made on a locked target file before giving up.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 5;

/// Starting delay for the locked-file exponential backoff.
pub const STARTING_BACKOFF_DELAY_MS: u64 = 100;

/// Backoff delays are capped at this value.
pub const MAX_BACKOFF_DELAY_MS: u64 = 2_000;
