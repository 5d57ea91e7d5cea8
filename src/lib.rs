//! vpnmupd - update daemon for vpnm
//!
//! Keeps a small set of locally installed executables in step with their
//! latest GitHub releases: `vpnm`, the privileged `vpnmd` service and the
//! tunnelling tools they drive (`tun2socks`, `v2ray`, `cloudflared`).
//!
//! # Architecture Overview
//!
//! ```text
//! Orchestrator ──check_all──▶ Dependency::check ──▶ version::power
//!      │                           │
//!      │                           └──▶ ReleaseSource::latest
//!      │
//!      └──install_updatable──▶ one task per Dependency::download
//!                                  ├──▶ ReleaseSource::fetch
//!                                  ├──▶ ArchiveBundle::extract (zip releases)
//!                                  └──▶ LocalFile::normalize_permissions
//! ```
//!
//! The service dependency (`vpnmd`) is stopped through its [`service::ServiceUnit`]
//! before its task starts and restarted on request afterwards.
//!
//! # Core Modules
//!
//! - [`version`] - version extraction and the tagged `Version` value
//! - [`release`] - release lookup and asset download
//! - [`files`] - installed files and permission normalization
//! - [`archive`] - zip extraction into install locations
//! - [`process`] - self-report and terminate-by-name
//! - [`dependency`] - per-dependency check and install, lock retry
//! - [`service`] - systemd unit generation and control
//! - [`installer`] - the orchestrator
//!
//! # Outer Surfaces
//!
//! - [`cli`] - `--update`, `--uninstall` and daemon mode
//! - [`server`] - local control API
//! - [`scheduler`] - daily checks
//! - [`config`] - TOML configuration
//! - [`core`] - error taxonomy and user-facing rendering

pub mod archive;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod dependency;
pub mod files;
pub mod installer;
pub mod process;
pub mod release;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod utils;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
