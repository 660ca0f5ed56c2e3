//! storeflow: event-triggered workflow execution engine
//!
//! Store events (orders, customers, subscriptions, ...) are routed to the
//! workflows listening for them. Each run walks the workflow's node graph,
//! evaluating conditions, sleeping through durable delays and dispatching
//! actions, while recording every step and broadcasting live status.

// Core configuration and setup
pub mod config;

// Error types shared across layers
pub mod error;

// Workflow management layer - definitions, storage, compiled graph cache
pub mod workflow;

// Runtime execution engine - routing, traversal and node handlers
pub mod runtime;

// HTTP API layer - events, manual triggers, runs, workflows, status stream
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, StoreError};
pub use runtime::{GraphExecutor, RunResult, TriggerRouter};
pub use server::start_server;
pub use workflow::{Workflow, WorkflowStore};
