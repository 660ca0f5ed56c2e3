//! Error types for the workflow engine
//!
//! `StoreError` covers persistence failures, `EngineError` everything the
//! executor, router and poller can report. Action handler failures never show
//! up here: they are folded into an `ActionResult` at the dispatch boundary.

use thiserror::Error;

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),

    #[error("invalid stored status '{0}'")]
    Status(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The run already reached a terminal status and can no longer change
    #[error("run '{0}' is already finished")]
    RunFinalized(String),
}

/// Errors raised while starting or executing a workflow run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),

    /// A node produced a failing result; the message is the step's own error
    #[error("{error}")]
    StepFailed { node_id: String, error: String },

    #[error("run exceeded the limit of {limit} node visits; the workflow graph may contain a cycle")]
    VisitBudgetExceeded { limit: usize },

    #[error("run was cancelled")]
    Cancelled,

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{workflow_id}' cannot be triggered manually: {reason}")]
    NotTriggerable { workflow_id: String, reason: String },

    #[error("run task aborted: {0}")]
    RunAborted(String),
}
