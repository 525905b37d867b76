//! HTTP request handlers for the API server.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::AppState;
use crate::models::{Snapshot, StructureNode};

#[derive(Debug, Deserialize)]
pub struct CreateSnapshotRequest {
    pub reference_id: String,
    /// Per-request source token; held in memory only.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    snapshot_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Snapshot state as exposed over the API.
#[derive(Debug, Serialize)]
struct SnapshotResponse {
    id: String,
    reference_id: String,
    document_id: Option<String>,
    status: String,
    triggered_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    structure: Option<Vec<StructureNode>>,
    structure_diff: Option<serde_json::Value>,
    changed_elements: Option<Vec<String>>,
    changed_elements_diff: Option<serde_json::Value>,
    error: Option<String>,
}

impl From<Snapshot> for SnapshotResponse {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            id: snapshot.id,
            reference_id: snapshot.reference_id,
            document_id: snapshot.document_id,
            status: snapshot.status.as_str().to_string(),
            triggered_at: snapshot.triggered_at,
            executed_at: snapshot.executed_at,
            finished_at: snapshot.finished_at,
            structure: snapshot.structure,
            structure_diff: snapshot.structure_diff,
            changed_elements: snapshot.changed_elements,
            changed_elements_diff: snapshot.changed_elements_diff,
            error: snapshot.error,
        }
    }
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!("{context}: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: context.to_string(),
        }),
    )
        .into_response()
}

/// Create a snapshot for a reference and enqueue its ingest job.
pub async fn create_snapshot(
    State(state): State<AppState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    match state
        .service
        .create_snapshot(&request.reference_id, request.token.as_deref())
        .await
    {
        Ok(snapshot_id) => (
            StatusCode::ACCEPTED,
            Json(CreatedResponse { snapshot_id }),
        )
            .into_response(),
        Err(e) => internal_error("failed to create snapshot", e),
    }
}

/// Current state of one snapshot.
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(snapshot_id): Path<String>,
) -> Response {
    match state.service.get_snapshot(&snapshot_id) {
        Ok(Some(snapshot)) => Json(SnapshotResponse::from(snapshot)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("snapshot not found: {snapshot_id}"),
            }),
        )
            .into_response(),
        Err(e) => internal_error("failed to load snapshot", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub reference_id: String,
}

/// External change notification naming a reference id.
///
/// Follows the same path as an explicit snapshot request.
pub async fn webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Response {
    match state
        .service
        .create_snapshot(&request.reference_id, None)
        .await
    {
        Ok(snapshot_id) => (
            StatusCode::ACCEPTED,
            Json(CreatedResponse { snapshot_id }),
        )
            .into_response(),
        Err(e) => internal_error("failed to create snapshot", e),
    }
}
