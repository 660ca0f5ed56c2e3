//! Run status broadcasting
//!
//! The executor reports node, edge and run progress through
//! [`StatusPublisher`]. [`StatusBus`] fans events out to in-process
//! subscribers (the SSE endpoint) over a tokio broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const NODE_STATUS: &str = "node-status";
pub const EDGE_ACTIVE: &str = "edge-active";
pub const WORKFLOW_COMPLETE: &str = "workflow-complete";

/// Fire-and-forget event sink; publishing never fails the caller
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, workflow_id: &str, event: &str, payload: Value);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub workflow_id: String,
    pub event: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

/// Broadcast bus for status events
///
/// Slow subscribers lag and lose old events instead of blocking the executor.
#[derive(Debug, Clone)]
pub struct StatusBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl StatusPublisher for StatusBus {
    fn publish(&self, workflow_id: &str, event: &str, payload: Value) {
        let event = StatusEvent {
            workflow_id: workflow_id.to_string(),
            event: event.to_string(),
            payload,
            emitted_at: Utc::now(),
        };
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!(workflow_id, "📭 Status event dropped, no subscribers");
        }
    }
}
