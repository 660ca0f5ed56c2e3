//! HTTP request / outgoing webhook action

use super::{ActionContext, ActionHandler};
use crate::workflow::types::ActionResult;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Sends `config.body` to `config.url`
///
/// Serves both `http.request` (default GET) and `webhook.send` (default POST).
/// A non-2xx response fails the step but keeps the response as output.
#[derive(Debug, Clone)]
pub struct HttpRequestHandler {
    action_type: &'static str,
}

impl HttpRequestHandler {
    pub fn new(action_type: &'static str) -> Self {
        Self { action_type }
    }

    fn default_method(&self) -> &'static str {
        if self.action_type == "webhook.send" {
            "POST"
        } else {
            "GET"
        }
    }
}

#[async_trait]
impl ActionHandler for HttpRequestHandler {
    fn action_type(&self) -> &'static str {
        self.action_type
    }

    async fn call(&self, config: &Value, ctx: &ActionContext<'_>) -> Result<ActionResult> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow!("{} missing 'url' parameter", self.action_type))?;

        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or(self.default_method())
            .to_uppercase();

        let mut request = match method.as_str() {
            "GET" => ctx.http.get(url),
            "POST" => ctx.http.post(url),
            "PUT" => ctx.http.put(url),
            "DELETE" => ctx.http.delete(url),
            "PATCH" => ctx.http.patch(url),
            other => return Err(anyhow!("unsupported HTTP method: {other}")),
        };

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        request = request
            .header("X-Workflow-Id", &ctx.execution.workflow_id)
            .header("X-Workflow-Run-Id", &ctx.execution.run_id);

        match config.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(body) => request = request.json(body),
        }

        tracing::debug!(method = %method, url, run_id = %ctx.execution.run_id, "🌍 Sending HTTP request");
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {e}"))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow!("failed to read response body: {e}"))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let output = json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
        });

        tracing::info!(method = %method, url, status = status.as_u16(), "📡 HTTP request completed");

        if status.is_success() {
            Ok(ActionResult::ok(output))
        } else {
            Ok(ActionResult::failed_with(
                format!("{method} {url} returned HTTP {}", status.as_u16()),
                output,
            ))
        }
    }
}
