//! Remote releases: where new versions come from.
//!
//! A [`ReleaseDescriptor`] names one asset in one repository. Resolving it
//! asks a [`ReleaseSource`] for the latest release, matches the asset by
//! exact name and records the tag's version text together with the asset's
//! download URL. Both are replaced together on every resolution, and both are
//! cleared when the lookup fails or the release lacks the asset.
//!
//! [`GitHubReleases`] is the production source: `GET
//! {api_base}/repos/{owner}/{repo}/releases/latest` with a fixed user agent.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UpdaterConfig;
use crate::core::UpdaterError;
use crate::utils::ProgressBar;
use crate::version::{self, Version};

/// The latest release of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRelease {
    /// Release tag, e.g. `v4.41.1`
    pub tag_name: String,
    /// Files attached to the release
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// One file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// Asset file name
    pub name: String,
    /// Direct download URL
    pub browser_download_url: String,
}

/// A downloaded asset body.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    /// `Content-Length` announced by the server, if any
    pub content_length: Option<u64>,
    /// The full body
    pub bytes: Vec<u8>,
}

/// Where release metadata and asset bodies come from.
pub trait ReleaseSource: Send + Sync {
    /// Fetch the latest release of `owner/repo`.
    fn latest<'a>(&'a self, owner: &'a str, repo: &'a str)
    -> BoxFuture<'a, Result<LatestRelease>>;

    /// Download the body at `url`, advancing `progress` as bytes arrive.
    fn fetch<'a>(&'a self, url: &'a str, progress: &'a ProgressBar)
    -> BoxFuture<'a, Result<Payload>>;
}

/// [`ReleaseSource`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubReleases {
    client: reqwest::Client,
    api_base: String,
}

impl GitHubReleases {
    /// Create a source talking to `api_base` with the given user agent and
    /// per-request timeout.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn new(api_base: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Create a source from the updater configuration.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        Self::new(
            &config.api_base,
            &config.user_agent,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn latest_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{owner}/{repo}/releases/latest", self.api_base)
    }
}

impl ReleaseSource for GitHubReleases {
    fn latest<'a>(
        &'a self,
        owner: &'a str,
        repo: &'a str,
    ) -> BoxFuture<'a, Result<LatestRelease>> {
        Box::pin(async move {
            let url = self.latest_url(owner, repo);
            debug!(%url, "Fetching latest release");

            let response = self
                .client
                .get(&url)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .with_context(|| format!("Failed to fetch {url}"))?;

            response
                .json::<LatestRelease>()
                .await
                .with_context(|| format!("Failed to parse release listing from {url}"))
        })
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        progress: &'a ProgressBar,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            let transport = |e: reqwest::Error| UpdaterError::TransportFailed {
                url: url.to_string(),
                reason: e.to_string(),
            };

            let mut response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(transport)?;

            let content_length = response.content_length();
            if let Some(len) = content_length {
                progress.set_length(len);
            }

            let capacity = content_length.and_then(|len| usize::try_from(len).ok()).unwrap_or(0);
            let mut bytes = Vec::with_capacity(capacity);
            while let Some(chunk) = response.chunk().await.map_err(transport)? {
                progress.inc(chunk.len() as u64);
                bytes.extend_from_slice(&chunk);
            }

            debug!(%url, size = bytes.len(), "Downloaded asset");
            Ok(Payload {
                content_length,
                bytes,
            })
        })
    }
}

/// A resolved release: the version text of its tag and the asset's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Version run extracted from the tag, empty when the tag has none
    pub version_text: String,
    /// Download URL of the matching asset
    pub download_url: String,
}

/// One asset of one repository, lazily resolved against the latest release.
#[derive(Debug, Clone)]
pub struct ReleaseDescriptor {
    asset: String,
    owner: String,
    repo: String,
    resolution: Option<Resolution>,
}

impl ReleaseDescriptor {
    /// An unresolved descriptor.
    pub fn new(
        asset: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            asset: asset.into(),
            owner: owner.into(),
            repo: repo.into(),
            resolution: None,
        }
    }

    /// The configured asset name.
    #[must_use]
    pub fn asset(&self) -> &str {
        &self.asset
    }

    /// Repository owner.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Repository name.
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// The current resolution, if any.
    #[must_use]
    pub const fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Version text of the resolved tag; empty when unresolved.
    #[must_use]
    pub fn version_text(&self) -> &str {
        self.resolution.as_ref().map_or("", |r| r.version_text.as_str())
    }

    /// Download URL of the resolved asset.
    #[must_use]
    pub fn download_url(&self) -> Option<&str> {
        self.resolution.as_ref().map(|r| r.download_url.as_str())
    }

    /// The resolved remote version, `None` when unknown.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        version::power(self.version_text()).ok()
    }

    /// Look up the latest release and match the configured asset.
    ///
    /// Returns the remote version, or `None` when the release lacks the asset
    /// or its tag carries no parseable version.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LookupFailed`] when the source fails. The
    /// previous resolution is cleared in that case.
    pub async fn resolve(&mut self, source: &dyn ReleaseSource) -> Result<Option<Version>> {
        let release = match source.latest(&self.owner, &self.repo).await {
            Ok(release) => release,
            Err(e) => {
                self.resolution = None;
                return Err(UpdaterError::LookupFailed {
                    owner: self.owner.clone(),
                    repo: self.repo.clone(),
                    reason: format!("{e:#}"),
                }
                .into());
            }
        };

        self.resolution = release.assets.iter().find(|asset| asset.name == self.asset).map(|asset| {
            Resolution {
                version_text: version::extract(&release.tag_name).to_string(),
                download_url: asset.browser_download_url.clone(),
            }
        });

        if self.resolution.is_none() {
            warn!(
                asset = %self.asset,
                repo = %format!("{}/{}", self.owner, self.repo),
                tag = %release.tag_name,
                "Latest release has no matching asset"
            );
        }

        Ok(self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeReleaseSource;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;

    #[tokio::test]
    async fn test_resolve_matches_asset_by_exact_name() {
        let source = FakeReleaseSource::default().with_release(
            "v2fly",
            "v2ray-core",
            "v4.41.1",
            &[("v2ray-linux-64.zip.dgst", "https://x/dgst"), ("v2ray-linux-64.zip", "https://x/zip")],
        );
        let mut descriptor = ReleaseDescriptor::new("v2ray-linux-64.zip", "v2fly", "v2ray-core");

        let version = descriptor.resolve(&source).await.unwrap();
        assert_eq!(version, Some(Version::Ordinal(400 + 410 + 1)));
        assert_eq!(descriptor.version_text(), "4.41.1");
        assert_eq!(descriptor.download_url(), Some("https://x/zip"));
    }

    #[tokio::test]
    async fn test_resolve_without_matching_asset() {
        let source = FakeReleaseSource::default().with_release(
            "anatolio-deb",
            "vpnm",
            "v0.3.1",
            &[("vpnm-darwin", "https://x/darwin")],
        );
        let mut descriptor = ReleaseDescriptor::new("vpnm", "anatolio-deb", "vpnm");

        assert_eq!(descriptor.resolve(&source).await.unwrap(), None);
        assert_eq!(descriptor.download_url(), None);
        assert_eq!(descriptor.version_text(), "");
    }

    #[tokio::test]
    async fn test_resolve_replaces_previous_resolution() {
        let mut source = FakeReleaseSource::default().with_release(
            "o",
            "r",
            "v1.0.0",
            &[("tool", "https://x/1")],
        );
        let mut descriptor = ReleaseDescriptor::new("tool", "o", "r");
        descriptor.resolve(&source).await.unwrap();
        assert_eq!(descriptor.download_url(), Some("https://x/1"));

        source = source.with_release("o", "r", "v1.1.0", &[("tool", "https://x/2")]);
        let version = descriptor.resolve(&source).await.unwrap();
        assert_eq!(version, Some(Version::Ordinal(110)));
        assert_eq!(descriptor.download_url(), Some("https://x/2"));
    }

    #[tokio::test]
    async fn test_lookup_failure_clears_resolution() {
        let source =
            FakeReleaseSource::default().with_release("o", "r", "v1.0.0", &[("tool", "https://x/1")]);
        let mut descriptor = ReleaseDescriptor::new("tool", "o", "r");
        descriptor.resolve(&source).await.unwrap();

        let failing = FakeReleaseSource::default();
        let err = descriptor.resolve(&failing).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::LookupFailed { .. })
        ));
        assert_eq!(descriptor.resolution(), None);
        assert_eq!(descriptor.version(), None);
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_github_latest_and_fetch_over_http() {
        let router = Router::new()
            .route(
                "/repos/{owner}/{repo}/releases/latest",
                get(|Path((owner, repo)): Path<(String, String)>| async move {
                    axum::Json(serde_json::json!({
                        "tag_name": format!("{owner}-{repo}-v1.2.3"),
                        "assets": [{"name": "tool", "browser_download_url": "unused"}]
                    }))
                }),
            )
            .route("/download/tool", get(|| async { vec![7u8; 1024] }));
        let base = serve(router).await;

        let source = GitHubReleases::new(&base, "Mozilla/5.0", Duration::from_secs(5)).unwrap();
        let release = source.latest("me", "tool").await.unwrap();
        assert_eq!(release.tag_name, "me-tool-v1.2.3");
        assert_eq!(release.assets.len(), 1);

        let progress = ProgressBar::hidden();
        let payload = source.fetch(&format!("{base}/download/tool"), &progress).await.unwrap();
        assert_eq!(payload.bytes, vec![7u8; 1024]);
        assert_eq!(payload.content_length, Some(1024));
        assert_eq!(progress.position(), 1024);
    }

    #[tokio::test]
    async fn test_github_fetch_error_status_is_transport_failure() {
        let router = Router::new()
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }));
        let base = serve(router).await;

        let source = GitHubReleases::new(&base, "Mozilla/5.0", Duration::from_secs(5)).unwrap();
        let err = source.fetch(&format!("{base}/missing"), &ProgressBar::hidden()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::TransportFailed { .. })
        ));
    }
}
