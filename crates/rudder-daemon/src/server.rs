//! HTTP surface: push webhooks and application queries.
//!
//! ```text
//! POST /api/webhook                         push payload -> refresh matching apps
//! GET  /api/applications                    names and states
//! GET  /api/applications/{name}             state plus latest result
//! GET  /api/applications/{name}/history     results, newest first
//! POST /api/applications/{name}/refresh     enqueue a refresh
//! POST /api/applications/{name}/sync        enqueue an explicit sync
//! ```

use std::future::Future;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use librudder_core::{Application, SyncResult, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::DaemonError;
use crate::supervisor::ControllerHandle;
use crate::worker::WorkerStatus;

/// Default number of results returned by the history endpoint
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// All-zero commit sent for branch deletions
const NULL_COMMIT: &str = "0000000000000000000000000000000000000000";

/// GitHub-style push event; GitLab and Gitea send compatible fields
#[derive(Debug, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    pub repository: PushRepository,
}

#[derive(Debug, Deserialize)]
pub struct PushRepository {
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub ssh_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushRepository {
    fn urls(&self) -> Vec<&str> {
        [&self.clone_url, &self.html_url, &self.ssh_url, &self.url]
            .into_iter()
            .filter_map(|url| url.as_deref())
            .filter(|url| !url.is_empty())
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub refreshed: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApplicationSummary {
    pub name: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<SyncStatus>,
}

#[derive(Debug, Serialize)]
pub struct ApplicationDetail {
    pub application: Application,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<SyncResult>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::ApplicationNotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the API router
pub fn router(controller: ControllerHandle) -> Router {
    Router::new()
        .route("/api/webhook", post(webhook))
        .route("/api/applications", get(list_applications))
        .route("/api/applications/{name}", get(get_application))
        .route("/api/applications/{name}/history", get(application_history))
        .route("/api/applications/{name}/refresh", post(refresh_application))
        .route("/api/applications/{name}/sync", post(sync_application))
        .with_state(controller)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    controller: ControllerHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DaemonError> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP API listening");
    }
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn webhook(
    State(controller): State<ControllerHandle>,
    Json(event): Json<PushEvent>,
) -> Response {
    let urls = event.repository.urls();
    if urls.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_payload",
                "message": "push event has no repository url",
            })),
        )
            .into_response();
    }

    let revision = event
        .after
        .filter(|commit| !commit.is_empty() && commit != NULL_COMMIT);

    let refreshed = controller
        .refresh_repo(&urls, event.git_ref.as_deref(), revision.clone())
        .await;

    if refreshed.is_empty() {
        warn!(git_ref = ?event.git_ref, "Push matched no application");
    } else {
        info!(applications = ?refreshed, revision = ?revision, "Push webhook refreshed applications");
    }
    Json(WebhookResponse { refreshed }).into_response()
}

async fn list_applications(
    State(controller): State<ControllerHandle>,
) -> Result<Json<Vec<ApplicationSummary>>, DaemonError> {
    let mut summaries = Vec::new();
    for name in controller.applications() {
        let status = controller.status(&name).await?;
        let last_status = controller.latest(&name)?.map(|result| result.status);
        summaries.push(ApplicationSummary {
            name,
            status,
            last_status,
        });
    }
    Ok(Json(summaries))
}

async fn get_application(
    State(controller): State<ControllerHandle>,
    Path(name): Path<String>,
) -> Result<Json<ApplicationDetail>, DaemonError> {
    let application = controller
        .application(&name)
        .ok_or_else(|| DaemonError::ApplicationNotFound(name.clone()))?;
    let status = controller.status(&name).await?;
    let latest = controller.latest(&name)?;
    Ok(Json(ApplicationDetail {
        application,
        status,
        latest,
    }))
}

async fn application_history(
    State(controller): State<ControllerHandle>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SyncResult>>, DaemonError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(controller.history(&name, limit)?))
}

async fn refresh_application(
    State(controller): State<ControllerHandle>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), DaemonError> {
    controller.refresh(&name, None).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"application": name, "queued": "refresh"})),
    ))
}

async fn sync_application(
    State(controller): State<ControllerHandle>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), DaemonError> {
    controller.sync(&name).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"application": name, "queued": "sync"})),
    ))
}
