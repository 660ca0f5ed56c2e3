//! HTTP API layer
//!
//! REST endpoints for event ingestion, manual triggers, run inspection and
//! cancellation, workflow upserts, and a server-sent-events feed of run status.

// Event ingestion and manual trigger endpoints
pub mod events;

// Run inspection and cancellation endpoints
pub mod runs;

// Workflow upsert/read and live status stream
pub mod workflows;

use crate::error::{EngineError, StoreError};
use crate::runtime::{StatusBus, TriggerRouter};
use crate::server::Engine;
use crate::workflow::{GraphRegistry, WorkflowStore};
use axum::http::StatusCode;
use axum::Router;
use std::sync::Arc;

/// Shared resources for all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub graphs: Arc<GraphRegistry>,
    pub router: Arc<TriggerRouter>,
    pub status: StatusBus,
}

impl From<&Engine> for AppState {
    fn from(engine: &Engine) -> Self {
        Self {
            store: engine.store.clone(),
            graphs: Arc::clone(&engine.graphs),
            router: Arc::clone(&engine.router),
            status: engine.status.clone(),
        }
    }
}

/// All API routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(events::create_event_routes())
        .merge(runs::create_run_routes())
        .merge(workflows::create_workflow_routes())
}

/// Status code for an engine error surfaced by a handler
pub(crate) fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::WorkflowNotFound(_) | EngineError::Store(StoreError::NotFound { .. }) => {
            StatusCode::NOT_FOUND
        }
        EngineError::NotTriggerable { .. } => StatusCode::CONFLICT,
        EngineError::InvalidGraph(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
