//! Control API route handlers.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::Uri;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::error::{ApiError, Result};
use crate::dependency::DependencyStatus;
use crate::installer::{Orchestrator, join_all};

/// Query of `GET /check`.
#[derive(Debug, Default, Deserialize)]
pub struct CheckQuery {
    /// Run a check cycle before answering instead of using the last one.
    #[serde(default)]
    pub refresh: bool,
}

/// Query of `POST /install`.
#[derive(Debug, Default, Deserialize)]
pub struct InstallQuery {
    /// Install every dependency, not only the updatable ones.
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /install`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallResponse {
    /// Executables whose install was launched
    pub launched: Vec<String>,
}

/// Body of `POST /restart`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RestartResponse {
    /// Whether the service is active
    pub started: bool,
}

fn query<T>(query: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    query.map(|Query(q)| q).map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// GET /check - dependencies flagged as updatable.
pub async fn check(
    State(orchestrator): State<Arc<Orchestrator>>,
    params: std::result::Result<Query<CheckQuery>, QueryRejection>,
) -> Result<Json<Vec<DependencyStatus>>> {
    let params = query(params)?;
    if params.refresh {
        debug!("Refreshing before answering check");
        orchestrator.check_all().await;
    }
    Ok(Json(orchestrator.updatable().await))
}

/// POST /install - launch the install cycle.
///
/// Responds as soon as the tasks are launched; their results are logged.
pub async fn install(
    State(orchestrator): State<Arc<Orchestrator>>,
    params: std::result::Result<Query<InstallQuery>, QueryRejection>,
) -> Result<Json<InstallResponse>> {
    let params = query(params)?;
    let handles = orchestrator.install_updatable(params.force).await;
    let launched: Vec<String> = handles.iter().map(|h| h.executable().to_string()).collect();

    tokio::spawn(async move {
        match join_all(handles).await {
            Ok(installed) => info!(installed = ?installed, "Install cycle finished"),
            Err(e) => error!(error = %format!("{e:#}"), "Install cycle failed"),
        }
    });

    Ok(Json(InstallResponse {
        launched,
    }))
}

/// POST /restart - restart the service stopped by the last install, once
/// that install has finished.
pub async fn restart(State(orchestrator): State<Arc<Orchestrator>>) -> Json<RestartResponse> {
    Json(RestartResponse {
        started: orchestrator.restart_service().await,
    })
}

/// Fallback for unknown routes.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
