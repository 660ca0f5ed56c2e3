//! Event ingestion and manual trigger endpoints
//!
//! Events are routed to every matching workflow and answered immediately with
//! the match count; manual triggers run one workflow and wait for its result.

use crate::api::{status_for, AppState};
use crate::runtime::RunResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of `POST /api/events`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub trigger_type: String,
    pub workspace_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Body of `POST /api/workflows/{id}/trigger`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTriggerRequest {
    #[serde(default = "default_triggered_by")]
    pub triggered_by: String,
    #[serde(default)]
    pub input: Value,
}

fn default_triggered_by() -> String {
    "api".to_string()
}

pub fn create_event_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events", post(ingest_event))
        .route("/api/workflows/{id}/trigger", post(trigger_workflow))
}

/// Route a business event to matching workflows
///
/// POST /api/events
/// Body: { "triggerType": "order.created", "workspaceId": "...", "payload": {...} }
/// Returns: { "matched": 2 }
async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<EventRequest>,
) -> Result<Json<Value>, StatusCode> {
    if event.trigger_type.trim().is_empty() || event.workspace_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::info!(
        trigger_type = %event.trigger_type,
        workspace_id = %event.workspace_id,
        "📥 Event received"
    );

    match state
        .router
        .route(&event.trigger_type, &event.workspace_id, event.payload)
        .await
    {
        // Runs continue in the background after their handles are dropped
        Ok(outcome) => Ok(Json(json!({ "matched": outcome.matched }))),
        Err(e) => {
            tracing::error!("❌ Failed to route event {}: {}", event.trigger_type, e);
            Err(status_for(&e))
        }
    }
}

/// Run a manual-trigger workflow and return its result
///
/// POST /api/workflows/{id}/trigger
/// Body: { "triggeredBy": "user-1", "input": {...} }
async fn trigger_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ManualTriggerRequest>,
) -> Result<Json<RunResult>, StatusCode> {
    match state
        .router
        .trigger_manually(&id, &request.triggered_by, request.input)
        .await
    {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            tracing::warn!("❌ Manual trigger of {} rejected: {}", id, e);
            Err(status_for(&e))
        }
    }
}
