//! Run inspection and cancellation endpoints

use crate::api::{status_for, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
}

/// GET /api/runs/{id}
/// Returns: { "run": {...}, "steps": [...] }
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let run = match state.store.get_run(&id).await {
        Ok(Some(run)) => run,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load run {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match state.store.list_steps(&id).await {
        Ok(steps) => Ok(Json(json!({ "run": run, "steps": steps }))),
        Err(e) => {
            tracing::error!("Failed to load steps of run {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/runs/{id}/cancel
/// Returns: { "cancelled": true } or false when the run had already finished
async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.store.get_run(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    match state.router.cancel(&id).await {
        Ok(cancelled) => Ok(Json(json!({ "cancelled": cancelled }))),
        Err(e) => {
            tracing::error!("Failed to cancel run {}: {}", id, e);
            Err(status_for(&e))
        }
    }
}
