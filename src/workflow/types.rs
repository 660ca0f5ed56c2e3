//! Core workflow type definitions
//!
//! Workflows arrive from the editor as JSON: a trigger type, an opaque trigger
//! config and a node/edge graph. Node payloads are decoded once into
//! [`NodeKind`] when the workflow is deserialized, so the executor never has to
//! poke at untyped `data` objects while walking the graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Trigger type for workflows started from the manual trigger entry point
pub const MANUAL_TRIGGER: &str = "manual";
pub const SCHEDULE_CRON: &str = "schedule.cron";
pub const SCHEDULE_INTERVAL: &str = "schedule.interval";

/// Trigger-type prefixes that get a typed view in the execution context
pub const VIEW_DOMAINS: [&str; 6] = [
    "order",
    "customer",
    "product",
    "subscription",
    "review",
    "auction",
];

/// A complete workflow definition
///
/// The engine only ever writes the run counters (`run_count`, `last_run_at`,
/// `last_error`); everything else belongs to the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (taken from the URL on upsert)
    #[serde(default)]
    pub id: String,
    /// Workspace (store) the workflow belongs to
    pub workspace_id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Trigger type, e.g. `order.created` or `schedule.interval`
    pub trigger: String,
    /// Per-trigger-type configuration, opaque to everything but the poller
    #[serde(default)]
    pub trigger_config: Value,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub run_count: i64,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Last edit time; compiled graphs are cached per (id, updated_at)
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Workflow {
    /// Number of nodes a run can record steps for (everything but the trigger)
    pub fn step_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| !matches!(node.kind, NodeKind::Trigger))
            .count()
    }

    pub fn is_schedule_triggered(&self) -> bool {
        self.trigger == SCHEDULE_CRON || self.trigger == SCHEDULE_INTERVAL
    }

    /// Active and published
    pub fn is_runnable(&self) -> bool {
        self.is_active && !self.is_draft
    }
}

/// A single node in the workflow graph
///
/// `data` keeps the payload exactly as the editor sent it (used for step input
/// snapshots and for writing the workflow back), `kind` is the decoded form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub data: Value,
    /// Editor-only fields (canvas position, labels...) carried through untouched
    pub extra: Map<String, Value>,
}

/// Wire shape of a node: `{ "id", "type", "data", ...editor fields }`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    data: Value,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let kind = NodeKind::decode(&raw.node_type, &raw.data)
            .ok_or_else(|| format!("node '{}' has unknown type '{}'", raw.id, raw.node_type))?;
        Ok(Self {
            id: raw.id,
            kind,
            data: raw.data,
            extra: raw.extra,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        Self {
            node_type: node.kind.type_name().to_string(),
            id: node.id,
            data: node.data,
            extra: node.extra,
        }
    }
}

/// Decoded node payload, one variant per node type
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Traversal root; carries no behaviour of its own
    Trigger,
    Action(ActionNode),
    Condition(ConditionSpec),
    Delay(DelaySpec),
}

impl NodeKind {
    /// Decode a node payload; `None` only for an unknown node type.
    ///
    /// Malformed condition/delay payloads still decode (to their invalid
    /// variants) so the failure surfaces on the step that visits them.
    fn decode(node_type: &str, data: &Value) -> Option<Self> {
        let kind = match node_type {
            "trigger" => NodeKind::Trigger,
            "action" => NodeKind::Action(ActionNode::decode(data)),
            "condition" => NodeKind::Condition(
                match serde_json::from_value::<RuleSet>(normalize_rule_payload(data)) {
                    Ok(rules) => ConditionSpec::Rules(rules),
                    Err(e) => ConditionSpec::Malformed(format!("malformed condition rules: {e}")),
                },
            ),
            "delay" => NodeKind::Delay(DelaySpec::decode(data)),
            _ => return None,
        };
        Some(kind)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Action(_) => "action",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
        }
    }
}

fn normalize_rule_payload(data: &Value) -> Value {
    // Condition nodes dropped on the canvas without rules carry `data: null`
    if data.is_null() {
        Value::Object(Map::new())
    } else {
        data.clone()
    }
}

/// Action node payload
#[derive(Debug, Clone)]
pub struct ActionNode {
    /// Action type, e.g. `email.send`; `None` when the editor left it unset
    pub action: Option<String>,
    pub config: Value,
}

impl ActionNode {
    fn decode(data: &Value) -> Self {
        Self {
            action: data
                .get("action")
                .and_then(Value::as_str)
                .filter(|action| !action.trim().is_empty())
                .map(str::to_string),
            config: data.get("config").cloned().unwrap_or(Value::Object(Map::new())),
        }
    }
}

/// Condition node payload
#[derive(Debug, Clone)]
pub enum ConditionSpec {
    Rules(RuleSet),
    Malformed(String),
}

/// A set of comparisons combined with AND or OR
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub logic: Logic,
}

/// One comparison, `field` and `value` may both contain `{{...}}` templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

/// Delay node payload
#[derive(Debug, Clone, PartialEq)]
pub enum DelaySpec {
    /// `{duration, unit}`
    Duration { amount: f64, unit: DelayUnit },
    /// `{dateField, offset}`, offset in minutes
    Until { date_field: String, offset_minutes: f64 },
    /// Payload that matches neither shape; fails when visited
    Invalid(String),
}

impl DelaySpec {
    fn decode(data: &Value) -> Self {
        if let Some(field) = data.get("dateField") {
            let Some(date_field) = field.as_str().filter(|f| !f.trim().is_empty()) else {
                return DelaySpec::Invalid("delay `dateField` must be a non-empty string".to_string());
            };
            let offset_minutes = match data.get("offset") {
                None | Some(Value::Null) => 0.0,
                Some(offset) => match number_like(offset) {
                    Some(offset) => offset,
                    None => {
                        return DelaySpec::Invalid(format!("delay offset '{offset}' is not a number"))
                    }
                },
            };
            return DelaySpec::Until {
                date_field: date_field.trim().to_string(),
                offset_minutes,
            };
        }

        let Some(duration) = data.get("duration") else {
            return DelaySpec::Invalid(
                "delay node needs either {duration, unit} or {dateField, offset}".to_string(),
            );
        };
        let Some(amount) = number_like(duration).filter(|n| n.is_finite() && *n >= 0.0) else {
            return DelaySpec::Invalid(format!(
                "delay duration '{duration}' is not a non-negative number"
            ));
        };
        let unit = data.get("unit").and_then(Value::as_str).unwrap_or("minutes");
        match unit.parse::<DelayUnit>() {
            Ok(unit) => DelaySpec::Duration { amount, unit },
            Err(e) => DelaySpec::Invalid(e),
        }
    }

    /// Action-type label recorded on the step
    pub fn action_type(&self) -> &'static str {
        match self {
            DelaySpec::Until { .. } => "delay.wait_until",
            _ => "delay.wait",
        }
    }
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn seconds(self) -> f64 {
        match self {
            DelayUnit::Seconds => 1.0,
            DelayUnit::Minutes => 60.0,
            DelayUnit::Hours => 3_600.0,
            DelayUnit::Days => 86_400.0,
        }
    }

    /// `None` when the product overflows a `Duration`
    pub fn to_duration(self, amount: f64) -> Option<Duration> {
        Duration::try_from_secs_f64(amount * self.seconds()).ok()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DelayUnit::Seconds => "seconds",
            DelayUnit::Minutes => "minutes",
            DelayUnit::Hours => "hours",
            DelayUnit::Days => "days",
        }
    }
}

impl FromStr for DelayUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" | "seconds" => Ok(DelayUnit::Seconds),
            "minute" | "minutes" => Ok(DelayUnit::Minutes),
            "hour" | "hours" => Ok(DelayUnit::Hours),
            "day" | "days" => Ok(DelayUnit::Days),
            other => Err(format!(
                "unsupported delay unit '{other}' (expected seconds, minutes, hours or days)"
            )),
        }
    }
}

/// Directed connection between two nodes
///
/// `source_handle` only matters on edges leaving a condition node, where it
/// names the branch ("yes"/"no") the edge belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

/// Uniform result of visiting a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl ActionResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Failure that still carries an output (e.g. the "no" branch of a broken condition)
    pub fn failed_with(error: impl Into<String>, output: Value) -> Self {
        Self {
            success: false,
            output: Some(output),
            error: Some(error.into()),
            skipped: false,
        }
    }

    pub fn skipped(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            skipped: true,
        }
    }
}

/// Per-run state used for template resolution
///
/// Built from the trigger payload at run start; `step_outputs` grows as nodes
/// complete. Dropped when the run ends, the Run/Step records are what persists.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub run_id: String,
    pub workspace_id: String,
    pub trigger_type: String,
    /// Raw trigger payload
    pub trigger_data: Value,
    /// Typed views keyed by domain (`order`, `customer`, ...)
    pub views: HashMap<String, Value>,
    /// Results of completed nodes keyed by node id
    pub step_outputs: HashMap<String, ActionResult>,
}

impl ExecutionContext {
    /// Create a context and derive the typed view for the trigger's domain
    ///
    /// For `order.created` the `order` view is `trigger_data.order` when the
    /// payload nests the entity, otherwise the payload itself.
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        workspace_id: impl Into<String>,
        trigger_type: impl Into<String>,
        trigger_data: Value,
    ) -> Self {
        let trigger_type = trigger_type.into();
        let mut views = HashMap::new();
        if let Some(domain) = view_domain(&trigger_type) {
            let view = match trigger_data.get(domain) {
                Some(nested @ Value::Object(_)) => nested.clone(),
                _ => trigger_data.clone(),
            };
            views.insert(domain.to_string(), view);
        }

        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            workspace_id: workspace_id.into(),
            trigger_type,
            trigger_data,
            views,
            step_outputs: HashMap::new(),
        }
    }

    pub fn view(&self, domain: &str) -> Option<&Value> {
        self.views.get(domain)
    }

    pub fn record_output(&mut self, node_id: &str, result: ActionResult) {
        self.step_outputs.insert(node_id.to_string(), result);
    }

    /// The `stepOutputs` map as JSON, stored as the run's final output
    pub fn outputs_json(&self) -> Value {
        serde_json::to_value(&self.step_outputs).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Domain of a trigger type (`order.created` -> `order`), if it has a typed view
pub fn view_domain(trigger_type: &str) -> Option<&'static str> {
    let prefix = trigger_type.split('.').next()?;
    VIEW_DOMAINS.iter().copied().find(|domain| *domain == prefix)
}

/// Lifecycle of a workflow run; only ever moves forward out of `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// One end-to-end execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub workspace_id: String,
    /// Trigger event name the run was started for
    pub trigger_event: String,
    /// Snapshot of the trigger payload
    pub trigger_payload: Value,
    pub status: RunStatus,
    /// Non-trigger node count at start
    pub total_steps: i64,
    pub steps_completed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Final `stepOutputs` map
    pub output: Option<Value>,
}

/// Fields needed to open a run record
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: String,
    pub workspace_id: String,
    pub trigger_event: String,
    pub trigger_payload: Value,
    pub total_steps: i64,
}

/// Partial update of a run; `None` leaves the column untouched
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub steps_completed: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: Option<Value>,
}

/// Execution record of one visited node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStep {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub action_type: String,
    pub resolved_config: Value,
    pub status: StepStatus,
    /// Node payload as configured
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub run_id: String,
    pub node_id: String,
    pub action_type: String,
    pub resolved_config: Value,
    pub input: Value,
}

#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn decodes_node_payloads_by_type() {
        let action = node(json!({
            "id": "n2",
            "type": "action",
            "data": { "action": "email.send", "config": { "to": "{{order.email}}" } }
        }));
        match &action.kind {
            NodeKind::Action(a) => {
                assert_eq!(a.action.as_deref(), Some("email.send"));
                assert_eq!(a.config["to"], "{{order.email}}");
            }
            other => panic!("expected action, got {other:?}"),
        }

        let condition = node(json!({
            "id": "n3",
            "type": "condition",
            "data": { "rules": [{ "field": "order.total", "operator": "greater_than", "value": "100" }], "logic": "or" }
        }));
        match &condition.kind {
            NodeKind::Condition(ConditionSpec::Rules(set)) => {
                assert_eq!(set.logic, Logic::Or);
                assert_eq!(set.rules.len(), 1);
            }
            other => panic!("expected rules, got {other:?}"),
        }

        let trigger = node(json!({ "id": "t", "type": "trigger", "data": { "label": "Order created" } }));
        assert!(matches!(trigger.kind, NodeKind::Trigger));
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let result = serde_json::from_value::<Node>(json!({ "id": "x", "type": "loop", "data": {} }));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_condition_decodes_to_malformed_variant() {
        let condition = node(json!({ "id": "c", "type": "condition", "data": { "rules": "nope" } }));
        assert!(matches!(condition.kind, NodeKind::Condition(ConditionSpec::Malformed(_))));
    }

    #[test]
    fn decodes_delay_shapes() {
        let fixed = DelaySpec::decode(&json!({ "duration": 5, "unit": "minutes" }));
        assert_eq!(fixed, DelaySpec::Duration { amount: 5.0, unit: DelayUnit::Minutes });

        let until = DelaySpec::decode(&json!({ "dateField": "subscription.renews_at", "offset": -60 }));
        assert_eq!(
            until,
            DelaySpec::Until { date_field: "subscription.renews_at".to_string(), offset_minutes: -60.0 }
        );

        assert!(matches!(
            DelaySpec::decode(&json!({ "duration": 3, "unit": "fortnights" })),
            DelaySpec::Invalid(_)
        ));
        assert!(matches!(DelaySpec::decode(&json!({ "duration": -1 })), DelaySpec::Invalid(_)));
        assert!(matches!(DelaySpec::decode(&json!({})), DelaySpec::Invalid(_)));
    }

    #[test]
    fn node_round_trips_editor_fields() {
        let raw = json!({
            "id": "n1",
            "type": "delay",
            "data": { "duration": 1, "unit": "hours" },
            "position": { "x": 10, "y": 20 }
        });
        let decoded = node(raw.clone());
        assert_eq!(serde_json::to_value(decoded).unwrap(), raw);
    }

    #[test]
    fn typed_view_prefers_nested_entity() {
        let flat = ExecutionContext::new("wf", "run", "ws", "order.created", json!({ "id": "O1" }));
        assert_eq!(flat.view("order"), Some(&json!({ "id": "O1" })));

        let nested = ExecutionContext::new(
            "wf",
            "run",
            "ws",
            "customer.tag_added",
            json!({ "customer": { "email": "a@b.com" }, "tag": "vip" }),
        );
        assert_eq!(nested.view("customer"), Some(&json!({ "email": "a@b.com" })));
        assert!(nested.view("order").is_none());
    }

    #[test]
    fn action_result_serializes_compactly() {
        let value = serde_json::to_value(ActionResult::ok(json!({ "id": 1 }))).unwrap();
        assert_eq!(value, json!({ "success": true, "output": { "id": 1 } }));

        let skipped = serde_json::to_value(ActionResult::skipped(json!({}))).unwrap();
        assert_eq!(skipped["skipped"], true);
    }

    #[test]
    fn step_count_ignores_trigger() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf", "workspaceId": "ws", "name": "n", "trigger": "order.created",
            "nodes": [
                { "id": "t", "type": "trigger" },
                { "id": "a", "type": "action", "data": { "action": "data.log" } }
            ]
        }))
        .unwrap();
        assert_eq!(workflow.step_count(), 1);
        assert!(workflow.is_runnable());
    }
}
