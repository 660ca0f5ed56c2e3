//! Workflow management layer
//!
//! Workflow definitions and run records, their SQLite persistence, and the
//! cache of compiled graphs the executor walks.

// Core workflow type definitions
pub mod types;

// SQLite persistence for workflows, runs and steps
pub mod storage;

// Lock-free cache of compiled workflow graphs using ArcSwap
pub mod registry;

pub use registry::{CompiledWorkflow, GraphRegistry};
pub use storage::{SqliteStore, WorkflowStore};
pub use types::{ActionResult, Edge, ExecutionContext, Node, NodeKind, RunStatus, Workflow};
