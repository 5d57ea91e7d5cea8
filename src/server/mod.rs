//! Local control API.
//!
//! ## Endpoints
//!
//! - `GET /check[?refresh=true]` - dependencies flagged as updatable
//! - `POST /install[?force=true]` - launch the install cycle
//! - `POST /restart` - restart the service stopped by the last install
//!
//! The orchestrator is shared with the scheduler and passed in explicitly.

pub mod error;
mod handlers;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::installer::Orchestrator;

pub use error::ApiError;
pub use handlers::{InstallResponse, RestartResponse};

/// Build the control API router.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/check", get(handlers::check))
        .route("/install", post(handlers::install))
        .route("/restart", post(handlers::restart))
        .fallback(handlers::not_found)
        .with_state(orchestrator)
}

/// Serve the control API on `addr` until Ctrl-C.
///
/// # Errors
///
/// Fails when the address cannot be bound or the server stops with an error.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Result<()> {
    let listener =
        TcpListener::bind(addr).await.with_context(|| format!("Failed to bind to {addr}"))?;
    info!(%addr, "Control API listening");

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Control API server failed")
}
