use super::{ActionContext, ActionHandler};
use crate::runtime::resolver::render;
use crate::workflow::types::ActionResult;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

/// `data.log`: writes `config.message` to the service log and echoes it
#[derive(Debug, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    fn action_type(&self) -> &'static str {
        "data.log"
    }

    async fn call(&self, config: &Value, ctx: &ActionContext<'_>) -> Result<ActionResult> {
        let message = config.get("message").map(render).unwrap_or_default();
        let level = config.get("level").and_then(Value::as_str).unwrap_or("info");

        let execution = ctx.execution;
        match level {
            "warn" | "warning" => tracing::warn!(
                workflow_id = %execution.workflow_id,
                run_id = %execution.run_id,
                "📝 {message}"
            ),
            "error" => tracing::error!(
                workflow_id = %execution.workflow_id,
                run_id = %execution.run_id,
                "📝 {message}"
            ),
            _ => tracing::info!(
                workflow_id = %execution.workflow_id,
                run_id = %execution.run_id,
                "📝 {message}"
            ),
        }

        Ok(ActionResult::ok(json!({ "logged": message, "level": level })))
    }
}
