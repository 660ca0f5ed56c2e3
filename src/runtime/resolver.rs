//! Template variable resolution
//!
//! Action configs and condition rules reference run data with `{{path}}`
//! expressions. The first path segment picks a root in the execution context:
//!
//! - `order`, `customer`, `product`, `subscription`, `review`, `auction`: the
//!   typed view for the trigger's domain, falling back to the raw payload
//! - `triggerData`: the raw payload
//! - `stepOutputs.<nodeId>`: the `ActionResult` of a completed node
//! - `workflow.id`, `workflow.runId`, `workspace.id`
//!
//! Any other root walks the whole path against the raw payload. Each segment
//! may carry one array index (`items[0]`). Missing values render as `""`.

use crate::workflow::types::{ExecutionContext, VIEW_DOMAINS};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("valid template pattern"));

/// Substitute every `{{path}}` in `template`
pub fn resolve(template: &str, ctx: &ExecutionContext) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    TEMPLATE
        .replace_all(template, |caps: &Captures| {
            lookup(&caps[1], ctx).map(|v| render(&v)).unwrap_or_default()
        })
        .into_owned()
}

/// Resolve templates in every string of a JSON tree; other scalars pass through
pub fn resolve_deep(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(resolve(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_deep(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_deep(v, ctx)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Look a dotted path up in the context; `None` for missing or null values
pub fn lookup(path: &str, ctx: &ExecutionContext) -> Option<Value> {
    let segments = parse_path(path.trim())?;
    let (root, rest) = segments.split_first()?;

    let found = if root.index.is_none() && VIEW_DOMAINS.iter().any(|d| *d == root.name) {
        let base = ctx.view(root.name).unwrap_or(&ctx.trigger_data);
        walk(base, rest)
    } else {
        match root.name {
            "triggerData" => walk(&ctx.trigger_data, rest),
            "stepOutputs" => {
                let (node, rest) = rest.split_first()?;
                let result = serde_json::to_value(ctx.step_outputs.get(node.name)?).ok()?;
                walk(&result, rest)
            }
            "workflow" => match rest {
                [seg] if seg.name == "id" => Some(Value::String(ctx.workflow_id.clone())),
                [seg] if seg.name == "runId" => Some(Value::String(ctx.run_id.clone())),
                _ => None,
            },
            "workspace" => match rest {
                [seg] if seg.name == "id" => Some(Value::String(ctx.workspace_id.clone())),
                _ => None,
            },
            _ => walk(&ctx.trigger_data, &segments),
        }
    };

    found.filter(|v| !v.is_null())
}

/// Text form of a resolved value
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, PartialEq)]
struct Segment<'a> {
    name: &'a str,
    index: Option<usize>,
}

impl Segment<'_> {
    fn apply(&self, value: &Value) -> Option<Value> {
        let field = if self.name.is_empty() {
            value
        } else {
            value.as_object()?.get(self.name)?
        };
        match self.index {
            Some(i) => field.as_array()?.get(i).cloned(),
            None => Some(field.clone()),
        }
    }
}

fn parse_path(path: &str) -> Option<Vec<Segment<'_>>> {
    if path.is_empty() {
        return None;
    }
    path.split('.')
        .map(|raw| {
            let raw = raw.trim();
            match raw.split_once('[') {
                Some((name, idx)) => {
                    let idx = idx.strip_suffix(']')?.trim().parse().ok()?;
                    Some(Segment { name, index: Some(idx) })
                }
                None if raw.is_empty() => None,
                None => Some(Segment { name: raw, index: None }),
            }
        })
        .collect()
}

fn walk(base: &Value, segments: &[Segment<'_>]) -> Option<Value> {
    let mut current = base.clone();
    for seg in segments {
        current = seg.apply(&current)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ActionResult;
    use serde_json::json;

    fn ctx(trigger: &str, payload: Value) -> ExecutionContext {
        ExecutionContext::new("wf-1", "run-1", "ws-1", trigger, payload)
    }

    #[test]
    fn resolves_typed_view_paths() {
        let c = ctx("order.created", json!({ "id": "O1", "email": "a@b.com", "total": 150 }));
        assert_eq!(resolve("Order {{order.id}} for {{ order.email }}", &c), "Order O1 for a@b.com");
        assert_eq!(resolve("{{order.total}}", &c), "150");
    }

    #[test]
    fn typed_view_falls_back_to_raw_payload() {
        let c = ctx("customer.tag_added", json!({ "id": "C1", "tag": "vip" }));
        assert_eq!(resolve("{{order.tag}}", &c), "vip");
        assert_eq!(resolve("{{customer.id}}", &c), "C1");
    }

    #[test]
    fn missing_values_render_empty() {
        let c = ctx("order.created", json!({ "id": "O1", "note": null }));
        assert_eq!(resolve("[{{order.missing}}][{{order.note}}][{{stepOutputs.n9.output}}]", &c), "[][][]");
        assert!(!resolve("{{nothing.here}}", &c).contains("undefined"));
    }

    #[test]
    fn array_indexes_and_unknown_roots() {
        let c = ctx(
            "order.created",
            json!({ "line_items": [{ "sku": "A-1" }, { "sku": "B-2" }], "shop": { "name": "Acme" } }),
        );
        assert_eq!(resolve("{{order.line_items[1].sku}}", &c), "B-2");
        assert_eq!(resolve("{{shop.name}}", &c), "Acme");
        assert_eq!(resolve("{{triggerData.line_items[0].sku}}", &c), "A-1");
        assert_eq!(resolve("{{order.line_items[5].sku}}", &c), "");
    }

    #[test]
    fn step_outputs_and_ids() {
        let mut c = ctx("order.created", json!({}));
        c.record_output("n2", ActionResult::ok(json!({ "id": 42, "tags": ["a"] })));
        assert_eq!(resolve("{{stepOutputs.n2.output.id}}", &c), "42");
        assert_eq!(resolve("{{stepOutputs.n2.success}}", &c), "true");
        assert_eq!(resolve("{{stepOutputs.n2.output.tags}}", &c), r#"["a"]"#);
        assert_eq!(resolve("{{workflow.id}}/{{workflow.runId}}/{{workspace.id}}", &c), "wf-1/run-1/ws-1");
    }

    #[test]
    fn objects_render_as_compact_json() {
        let c = ctx("product.updated", json!({ "product": { "dims": { "w": 1 } } }));
        assert_eq!(resolve("{{product.dims}}", &c), r#"{"w":1}"#);
    }

    #[test]
    fn resolve_deep_walks_nested_values() {
        let c = ctx("order.created", json!({ "id": "O1" }));
        let config = json!({
            "subject": "Order {{order.id}}",
            "retries": 3,
            "list": ["{{order.id}}", true],
            "nested": { "k": "{{workflow.id}}" }
        });
        let resolved = resolve_deep(&config, &c);
        assert_eq!(
            resolved,
            json!({ "subject": "Order O1", "retries": 3, "list": ["O1", true], "nested": { "k": "wf-1" } })
        );
        assert_eq!(resolve_deep(&resolved, &c), resolved);
    }

    #[test]
    fn lookup_keeps_json_types() {
        let c = ctx("order.created", json!({ "total": 12.5 }));
        assert_eq!(lookup("order.total", &c), Some(json!(12.5)));
        assert_eq!(lookup("", &c), None);
        assert_eq!(lookup("order.items[x]", &c), None);
    }
}
