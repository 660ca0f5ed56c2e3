//! Workflow endpoints
//!
//! Upsert and read workflow definitions, plus a live status stream. Saving a
//! workflow drops its compiled graph so the next run picks up the new version.

use crate::api::AppState;
use crate::runtime::broadcast::StatusEvent;
use crate::workflow::{CompiledWorkflow, Workflow};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::broadcast::{error::RecvError, Receiver};

/// Response for workflow upserts
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for workflow upserts
#[derive(Debug, Deserialize)]
pub struct SaveWorkflowRequest {
    pub workflow: Workflow,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}", get(get_workflow).put(save_workflow))
        .route("/api/workflows/{id}/status", get(status_stream))
}

/// Create or replace a workflow
///
/// PUT /api/workflows/{id}
/// Body: { "workflow": { "workspaceId": "...", "name": "...", "trigger": "...", "nodes": [...], "edges": [...] } }
///
/// Published workflows must compile; drafts are stored as-is.
async fn save_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let mut workflow = payload.workflow;
    workflow.id = id;
    workflow.updated_at = Utc::now();

    if workflow.name.trim().is_empty() || workflow.workspace_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !workflow.is_draft {
        if let Err(e) = CompiledWorkflow::compile(&workflow) {
            tracing::warn!("❌ Rejected workflow {}: {}", workflow.id, e);
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    if let Err(e) = state.store.save_workflow(&workflow).await {
        tracing::error!("Failed to save workflow {}: {}", workflow.id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    state.graphs.invalidate(&workflow.id);

    tracing::info!("🔥 Saved workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' saved successfully", workflow.name),
    }))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    match state.store.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Server-sent events for one workflow's runs
///
/// GET /api/workflows/{id}/status
/// Event names: node-status, edge-active, workflow-complete
async fn status_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!("📡 Status stream opened for workflow {}", id);
    Sse::new(workflow_events(state.status.subscribe(), id)).keep_alive(KeepAlive::default())
}

fn workflow_events(
    rx: Receiver<StatusEvent>,
    workflow_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, workflow_id), |(mut rx, workflow_id)| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.workflow_id == workflow_id => {
                    let sse = match Event::default().event(&event.event).json_data(&event.payload) {
                        Ok(sse) => sse,
                        Err(e) => {
                            tracing::warn!("⚠️ Failed to encode status event: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok(sse), (rx, workflow_id)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Status stream for {} lagged, {} events skipped", workflow_id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
