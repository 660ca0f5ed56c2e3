#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storeflow::runtime::{
    ActionContext, ActionHandler, ActionRegistry, DurableSleeper, GraphExecutor, StatusPublisher,
    TriggerRouter,
};
use storeflow::workflow::types::ActionResult;
use storeflow::workflow::{GraphRegistry, SqliteStore, Workflow, WorkflowStore};
use tokio::sync::Semaphore;

/// Everything a test needs to drive runs against a temporary database
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub executor: Arc<GraphExecutor>,
    pub router: Arc<TriggerRouter>,
    pub sleeper: Arc<RecordingSleeper>,
    pub events: Arc<RecordingPublisher>,
    pub calls: Calls,
    _dir: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub workspace_concurrency: usize,
    pub max_node_visits: usize,
    /// Delays block until `RecordingSleeper::release` is called
    pub hold_delays: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            workspace_concurrency: 5,
            max_node_visits: 1000,
            hold_delays: false,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let url = format!("sqlite://{}", dir.path().join("storeflow.db").display());
        let store = Arc::new(SqliteStore::connect(&url).await.expect("open store"));
        let dyn_store: Arc<dyn WorkflowStore> = store.clone();

        let calls = Calls::default();
        let mut actions = ActionRegistry::new();
        actions.register(RecordingAction::new("email.send", calls.clone()));
        actions.register(RecordingAction::new("customer.add_tag", calls.clone()));
        actions.register(FailingAction("sms.send"));
        actions.register(PanickingAction("social.post"));

        let sleeper = Arc::new(RecordingSleeper::new(options.hold_delays));
        let events = Arc::new(RecordingPublisher::default());

        let executor = Arc::new(
            GraphExecutor::new(
                Arc::clone(&dyn_store),
                Arc::new(GraphRegistry::new()),
                Arc::new(actions),
                sleeper.clone(),
                events.clone(),
            )
            .with_max_node_visits(options.max_node_visits),
        );
        let router = Arc::new(TriggerRouter::new(
            dyn_store,
            Arc::clone(&executor),
            options.workspace_concurrency,
        ));

        Self {
            store,
            executor,
            router,
            sleeper,
            events,
            calls,
            _dir: dir,
        }
    }

    pub async fn save(&self, workflow: &Workflow) {
        self.store.save_workflow(workflow).await.expect("save workflow");
    }
}

/// Configs received by recording actions, in call order
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<(String, Value)>>>);

impl Calls {
    pub fn all(&self) -> Vec<(String, Value)> {
        self.0.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|(_, config)| config.get("label").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub struct RecordingAction {
    action_type: &'static str,
    calls: Calls,
}

impl RecordingAction {
    pub fn new(action_type: &'static str, calls: Calls) -> Self {
        Self { action_type, calls }
    }
}

#[async_trait]
impl ActionHandler for RecordingAction {
    fn action_type(&self) -> &'static str {
        self.action_type
    }

    async fn call(&self, config: &Value, _ctx: &ActionContext<'_>) -> anyhow::Result<ActionResult> {
        self.calls
            .0
            .lock()
            .unwrap()
            .push((self.action_type.to_string(), config.clone()));
        Ok(ActionResult::ok(json!({ "sent": true })))
    }
}

pub struct FailingAction(pub &'static str);

#[async_trait]
impl ActionHandler for FailingAction {
    fn action_type(&self) -> &'static str {
        self.0
    }

    async fn call(&self, _config: &Value, _ctx: &ActionContext<'_>) -> anyhow::Result<ActionResult> {
        Err(anyhow!("provider unavailable"))
    }
}

pub struct PanickingAction(pub &'static str);

#[async_trait]
impl ActionHandler for PanickingAction {
    fn action_type(&self) -> &'static str {
        self.0
    }

    async fn call(&self, _config: &Value, _ctx: &ActionContext<'_>) -> anyhow::Result<ActionResult> {
        panic!("handler blew up");
    }
}

/// Sleeper that records every request instead of waiting out real time
pub struct RecordingSleeper {
    requests: Mutex<Vec<SleepRequest>>,
    gate: Option<Semaphore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SleepRequest {
    For { key: String, duration: Duration },
    Until { key: String, wake_at: DateTime<Utc> },
}

impl SleepRequest {
    pub fn key(&self) -> &str {
        match self {
            SleepRequest::For { key, .. } | SleepRequest::Until { key, .. } => key,
        }
    }
}

impl RecordingSleeper {
    pub fn new(hold: bool) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            gate: hold.then(|| Semaphore::new(0)),
        }
    }

    pub fn requests(&self) -> Vec<SleepRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Let `n` held delays finish
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    async fn wait(&self, request: SleepRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        Ok(())
    }
}

#[async_trait]
impl DurableSleeper for RecordingSleeper {
    async fn sleep(&self, key: &str, duration: Duration) -> anyhow::Result<()> {
        self.wait(SleepRequest::For {
            key: key.to_string(),
            duration,
        })
        .await
    }

    async fn sleep_until(&self, key: &str, wake_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.wait(SleepRequest::Until {
            key: key.to_string(),
            wake_at,
        })
        .await
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingPublisher {
    /// `(workflow_id, event, payload)` in publish order
    pub fn all(&self) -> Vec<(String, String, Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn named(&self, event: &str) -> Vec<Value> {
        self.all()
            .into_iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, payload)| payload)
            .collect()
    }
}

impl StatusPublisher for RecordingPublisher {
    fn publish(&self, workflow_id: &str, event: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((workflow_id.to_string(), event.to_string(), payload));
    }
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run id embedded in a `delay:<run>:<node>:<visit>` sleep key
pub fn run_id_of(key: &str) -> String {
    key.split(':').nth(1).unwrap_or_default().to_string()
}

pub fn workflow(id: &str, workspace: &str, trigger: &str, nodes: Value, edges: Value) -> Workflow {
    serde_json::from_value(json!({
        "id": id,
        "workspaceId": workspace,
        "name": format!("workflow {id}"),
        "trigger": trigger,
        "nodes": nodes,
        "edges": edges,
    }))
    .expect("valid workflow json")
}

pub fn trigger_node() -> Value {
    json!({ "id": "trigger", "type": "trigger", "data": {} })
}

pub fn action_node(id: &str, action: &str, config: Value) -> Value {
    json!({ "id": id, "type": "action", "data": { "action": action, "config": config } })
}

pub fn node(id: &str, node_type: &str, data: Value) -> Value {
    json!({ "id": id, "type": node_type, "data": data })
}

pub fn edge(source: &str, target: &str) -> Value {
    json!({ "id": format!("{source}->{target}"), "source": source, "target": target })
}

pub fn branch(source: &str, target: &str, handle: &str) -> Value {
    json!({
        "id": format!("{source}-{handle}->{target}"),
        "source": source,
        "target": target,
        "sourceHandle": handle,
    })
}

/// `trigger -> email` workflow labelled `label`
pub fn single_email(id: &str, workspace: &str, trigger: &str, label: &str) -> Workflow {
    workflow(
        id,
        workspace,
        trigger,
        json!([trigger_node(), action_node("email", "email.send", json!({ "label": label }))]),
        json!([edge("trigger", "email")]),
    )
}
