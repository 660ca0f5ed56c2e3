//! Runtime execution engine
//!
//! Everything that happens once an event arrives: routing it to workflows,
//! walking their graphs, and the per-node handlers (conditions, delays,
//! actions) plus the template resolver they share.

// Template variable resolution against the execution context
pub mod resolver;

// Condition node rule evaluation
pub mod condition;

// Delay node handling and the durable sleep it relies on
pub mod delay;
pub mod durable;

// Action handler registry and dispatch
pub mod actions;

// Status events for live run views
pub mod broadcast;

// Graph traversal and run/step bookkeeping
pub mod engine;

// Event-to-workflow routing with per-workspace concurrency limits
pub mod router;

// Periodic due-check of schedule-triggered workflows
pub mod scheduler;

pub use actions::{ActionContext, ActionHandler, ActionRegistry};
pub use broadcast::{StatusBus, StatusEvent, StatusPublisher};
pub use durable::{DurableSleeper, SqliteSleeper};
pub use engine::{GraphExecutor, RunResult};
pub use router::{RouteOutcome, TriggerRouter};
pub use scheduler::ScheduledTriggerPoller;
