//! Action dispatch
//!
//! Action nodes name an action type (`email.send`, `order.add_tag`, ...).
//! Handlers are registered once at startup; the registry is read-only after
//! that. Dispatch never returns an error: handler failures and panics become
//! failing [`ActionResult`]s, and known actions without a handler succeed as
//! a `not_implemented` no-op.

mod http;
mod log;

pub use http::HttpRequestHandler;
pub use log::LogHandler;

use crate::runtime::resolver::resolve_deep;
use crate::workflow::types::{ActionResult, ExecutionContext};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Every action type an action node may reference
pub const KNOWN_ACTIONS: &[&str] = &[
    "email.send",
    "sms.send",
    "webhook.send",
    "http.request",
    "slack.send_message",
    "discord.send_message",
    "customer.add_tag",
    "customer.remove_tag",
    "order.add_note",
    "order.add_tag",
    "shopify.create_order",
    "shopify.update_inventory",
    "crm.create_contact",
    "social.post",
    "data.log",
];

/// Action types the executor handles itself
pub const HANDLED_SEPARATELY: &[&str] = &["condition.if", "delay.wait", "delay.wait_until"];

/// Handles available to an action handler for the duration of one call
pub struct ActionContext<'a> {
    pub execution: &'a ExecutionContext,
    pub http: &'a reqwest::Client,
}

/// One integration, invoked with its already-resolved config
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> &'static str;

    async fn call(&self, config: &Value, ctx: &ActionContext<'_>) -> anyhow::Result<ActionResult>;
}

pub struct ActionRegistry {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("ActionRegistry").field("handlers", &types).finish()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    /// Registry with no handlers
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            handlers: HashMap::new(),
            http,
        }
    }

    /// Registry with the handlers shipped in this crate
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(HttpRequestHandler::new("http.request"));
        registry.register(HttpRequestHandler::new("webhook.send"));
        registry.register(LogHandler);
        registry
    }

    /// Add a handler, replacing any previous one for the same action type
    pub fn register(&mut self, handler: impl ActionHandler + 'static) -> &mut Self {
        let action_type = handler.action_type();
        if self.handlers.insert(action_type, Arc::new(handler)).is_some() {
            tracing::warn!(action_type, "⚠️ Replaced existing action handler");
        }
        self
    }

    pub fn has_handler(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Resolve templates in `config`, then dispatch
    pub async fn dispatch(&self, action_type: &str, config: &Value, ctx: &ExecutionContext) -> ActionResult {
        let resolved = resolve_deep(config, ctx);
        self.dispatch_resolved(action_type, &resolved, ctx).await
    }

    /// Dispatch a config whose templates were already resolved
    pub async fn dispatch_resolved(
        &self,
        action_type: &str,
        config: &Value,
        ctx: &ExecutionContext,
    ) -> ActionResult {
        if HANDLED_SEPARATELY.contains(&action_type) {
            return ActionResult::skipped(json!({ "handledSeparately": true }));
        }

        let Some(handler) = self.handlers.get(action_type) else {
            if KNOWN_ACTIONS.contains(&action_type) {
                tracing::warn!(action_type, "🚧 No handler registered, skipping action");
                return ActionResult::ok(json!({ "not_implemented": true, "action": action_type }));
            }
            return ActionResult::failed(format!("unknown action type '{action_type}'"));
        };

        let action_ctx = ActionContext {
            execution: ctx,
            http: &self.http,
        };

        match AssertUnwindSafe(handler.call(config, &action_ctx)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(action_type, error = %e, "❌ Action handler failed");
                ActionResult::failed(format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(action_type, panic = %message, "💥 Action handler panicked");
                ActionResult::failed(format!("action handler panicked: {message}"))
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
