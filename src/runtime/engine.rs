//! Graph executor
//!
//! Walks a workflow graph from its trigger node, depth-first and strictly
//! sequential: every outgoing edge of a node is followed in edge-list order,
//! each branch to completion before the next, except after a condition node
//! where only the edges on the chosen handle are followed. Every visited node
//! gets a step record; the run record tracks progress and the final outcome.
//!
//! The executor tolerates cyclic graphs by capping node visits per run, and
//! stops at the next node boundary (or mid-delay) when its run is cancelled.
//!
//! A run interrupted by a restart is resumed by walking the graph again:
//! recorded completed steps are replayed from their stored output, the step
//! that was in flight is re-entered, and traversal continues live from there.

use crate::error::{EngineError, StoreError};
use crate::runtime::actions::{panic_message, ActionRegistry};
use crate::runtime::broadcast::{StatusPublisher, EDGE_ACTIVE, NODE_STATUS, WORKFLOW_COMPLETE};
use crate::runtime::condition::{evaluate_node, Branch};
use crate::runtime::delay::{delay, sleep_key};
use crate::runtime::durable::DurableSleeper;
use crate::runtime::resolver::resolve_deep;
use crate::workflow::registry::{CompiledWorkflow, EdgeRoute, GraphRegistry};
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{
    ActionResult, ExecutionContext, NewRun, NewStep, Node, NodeKind, RunStatus, RunUpdate,
    StepStatus, StepUpdate, Workflow, WorkflowRun, WorkflowRunStep,
};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_NODE_VISITS: usize = 1000;

/// Outcome of one run, as returned to callers of `execute`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub steps_completed: i64,
    pub total_steps: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mutable bookkeeping for one run
struct RunState<'a> {
    run: &'a WorkflowRun,
    ctx: ExecutionContext,
    steps_completed: i64,
    visits: usize,
    /// Key: node id, value: times visited so far in this run
    node_visits: HashMap<String, usize>,
    /// Steps recorded before an interruption, consumed in traversal order
    replay: VecDeque<WorkflowRunStep>,
}

pub struct GraphExecutor {
    store: Arc<dyn WorkflowStore>,
    graphs: Arc<GraphRegistry>,
    actions: Arc<ActionRegistry>,
    sleeper: Arc<dyn DurableSleeper>,
    publisher: Arc<dyn StatusPublisher>,
    max_node_visits: usize,
    /// Key: run id of in-flight runs
    cancellations: DashMap<String, CancellationToken>,
}

impl GraphExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        graphs: Arc<GraphRegistry>,
        actions: Arc<ActionRegistry>,
        sleeper: Arc<dyn DurableSleeper>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            store,
            graphs,
            actions,
            sleeper,
            publisher,
            max_node_visits: DEFAULT_MAX_NODE_VISITS,
            cancellations: DashMap::new(),
        }
    }

    pub fn with_max_node_visits(mut self, limit: usize) -> Self {
        self.max_node_visits = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Runs currently executing in this process
    pub fn active_runs(&self) -> usize {
        self.cancellations.len()
    }

    /// Execute one run of `workflow` for `trigger_payload`
    ///
    /// Failing nodes, invalid graphs and cancellation all produce an `Ok`
    /// result with the corresponding status; `Err` means the run could not be
    /// recorded at all.
    pub async fn execute(&self, workflow: &Workflow, trigger_payload: Value) -> Result<RunResult, EngineError> {
        let run = self
            .store
            .create_run(NewRun {
                workflow_id: workflow.id.clone(),
                workspace_id: workflow.workspace_id.clone(),
                trigger_event: workflow.trigger.clone(),
                trigger_payload,
                total_steps: workflow.step_count() as i64,
            })
            .await?;

        tracing::info!(
            workflow_id = %workflow.id,
            run_id = %run.id,
            total_steps = run.total_steps,
            "🚀 Starting workflow run"
        );
        self.drive(workflow, &run, Vec::new()).await
    }

    /// Continue a run that a previous process left `running`
    pub async fn resume(&self, run: WorkflowRun) -> Result<RunResult, EngineError> {
        let Some(workflow) = self.store.get_workflow(&run.workflow_id).await? else {
            let error = format!("workflow '{}' no longer exists", run.workflow_id);
            tracing::warn!(run_id = %run.id, "⚠️ Cannot resume run: {}", error);
            self.store
                .update_run(
                    &run.id,
                    RunUpdate {
                        status: Some(RunStatus::Failed),
                        completed_at: Some(Utc::now()),
                        error: Some(error),
                        ..Default::default()
                    },
                )
                .await?;
            self.publisher.publish(
                &run.workflow_id,
                WORKFLOW_COMPLETE,
                json!({
                    "runId": run.id,
                    "status": RunStatus::Failed.as_str(),
                    "stepsCompleted": run.steps_completed,
                    "totalSteps": run.total_steps,
                }),
            );
            return Err(EngineError::WorkflowNotFound(run.workflow_id));
        };

        let recorded = self.store.list_steps(&run.id).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            run_id = %run.id,
            recorded_steps = recorded.len(),
            "♻️ Resuming interrupted workflow run"
        );
        self.drive(&workflow, &run, recorded).await
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        run: &WorkflowRun,
        replay: Vec<WorkflowRunStep>,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        let token = CancellationToken::new();
        self.cancellations.insert(run.id.clone(), token.clone());

        let mut state = RunState {
            run,
            ctx: ExecutionContext::new(
                &workflow.id,
                &run.id,
                &run.workspace_id,
                &run.trigger_event,
                run.trigger_payload.clone(),
            ),
            steps_completed: 0,
            visits: 0,
            node_visits: HashMap::new(),
            replay: replay.into(),
        };

        let outcome = match self.graphs.get_or_compile(workflow) {
            Ok(compiled) => AssertUnwindSafe(self.traverse(&compiled, &mut state, &token))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(run_id = %run.id, panic = %message, "💥 Run traversal panicked");
                    Err(EngineError::RunAborted(format!("traversal panicked: {message}")))
                }),
            Err(e) => Err(e),
        };

        let result = self.finish(workflow, &state, outcome).await;
        self.cancellations.remove(&run.id);

        if let Ok(result) = &result {
            tracing::info!(
                workflow_id = %workflow.id,
                run_id = %run.id,
                status = %result.status,
                steps_completed = result.steps_completed,
                "🏁 Workflow run finished in {:?}",
                started.elapsed()
            );
        }
        result
    }

    /// Cancel a running run; `false` if it had already finished
    pub async fn cancel(&self, run_id: &str) -> Result<bool, EngineError> {
        let changed = self.store.cancel_run(run_id).await?;
        if let Some(token) = self.cancellations.get(run_id) {
            token.cancel();
        }
        if changed {
            tracing::info!(run_id, "🛑 Run cancelled");
        }
        Ok(changed)
    }

    async fn traverse(
        &self,
        graph: &CompiledWorkflow,
        state: &mut RunState<'_>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let trigger = graph.trigger();
        let trigger_id = graph.node(trigger).id.clone();
        self.node_status(state, &trigger_id, "executing", None, None);
        self.node_status(state, &trigger_id, "success", None, None);

        // Children are pushed in reverse so they pop in edge-list order
        let mut stack: Vec<(NodeIndex, &EdgeRoute)> = graph.outgoing(trigger);
        stack.reverse();

        while let Some((idx, via)) = stack.pop() {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            state.visits += 1;
            if state.visits > self.max_node_visits {
                tracing::warn!(
                    run_id = %state.run.id,
                    limit = self.max_node_visits,
                    "🔁 Node visit budget exhausted"
                );
                return Err(EngineError::VisitBudgetExceeded {
                    limit: self.max_node_visits,
                });
            }

            self.publish(
                state,
                EDGE_ACTIVE,
                json!({ "edgeId": via.id, "active": true, "runId": state.run.id }),
            );

            let node = graph.node(idx);
            let branch = self.visit(node, state, token).await?;

            let mut next: Vec<(NodeIndex, &EdgeRoute)> = graph
                .outgoing(idx)
                .into_iter()
                .filter(|(_, route)| match branch {
                    Some(branch) => route.handle.as_deref() == Some(branch.as_str()),
                    None => true,
                })
                .collect();
            next.reverse();
            stack.extend(next);
        }

        Ok(())
    }

    /// Execute one node and record its step; returns the chosen branch for conditions
    async fn visit(
        &self,
        node: &Node,
        state: &mut RunState<'_>,
        token: &CancellationToken,
    ) -> Result<Option<Branch>, EngineError> {
        let visit = {
            let count = state.node_visits.entry(node.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let recorded = match state.replay.front() {
            Some(step) if step.node_id == node.id => state.replay.pop_front(),
            Some(step) => {
                tracing::warn!(
                    run_id = %state.run.id,
                    expected = %step.node_id,
                    node_id = %node.id,
                    "⚠️ Recorded steps no longer match the graph, continuing live"
                );
                state.replay.clear();
                None
            }
            None => None,
        };
        if let Some(step) = recorded.as_ref().filter(|step| step.status == StepStatus::Completed) {
            return Ok(self.replay_step(node, step, state));
        }

        let (action_type, resolved_config) = match &node.kind {
            NodeKind::Action(action) => (
                action.action.clone().unwrap_or_default(),
                resolve_deep(&action.config, &state.ctx),
            ),
            NodeKind::Condition(_) => ("condition.if".to_string(), node.data.clone()),
            NodeKind::Delay(spec) => (spec.action_type().to_string(), node.data.clone()),
            NodeKind::Trigger => ("trigger".to_string(), Value::Null),
        };

        tracing::info!(
            run_id = %state.run.id,
            node_id = %node.id,
            action_type = %action_type,
            "📍 Executing node"
        );

        let step_id = match recorded {
            Some(step) => {
                tracing::info!(run_id = %state.run.id, node_id = %node.id, "🔁 Re-entering interrupted step");
                step.id
            }
            None => {
                self.store
                    .create_step(NewStep {
                        run_id: state.run.id.clone(),
                        node_id: node.id.clone(),
                        action_type: action_type.clone(),
                        resolved_config: resolved_config.clone(),
                        input: json!({ "type": node.kind.type_name(), "data": node.data }),
                    })
                    .await?
                    .id
            }
        };
        self.node_status(state, &node.id, "executing", None, None);

        let mut branch = None;
        let result = match &node.kind {
            NodeKind::Action(action) => match action.action {
                Some(_) => {
                    self.actions
                        .dispatch_resolved(&action_type, &resolved_config, &state.ctx)
                        .await
                }
                None => ActionResult::failed(format!("action node '{}' has no action type", node.id)),
            },
            NodeKind::Condition(spec) => {
                let (chosen, result) = evaluate_node(spec, &state.ctx);
                branch = Some(chosen);
                result
            }
            NodeKind::Delay(spec) => {
                let key = sleep_key(&state.run.id, &node.id, visit);
                tokio::select! {
                    result = delay(spec, &state.ctx, self.sleeper.as_ref(), &key) => result,
                    _ = token.cancelled() => {
                        self.store
                            .update_step(&step_id, StepUpdate {
                                status: Some(StepStatus::Failed),
                                error: Some(EngineError::Cancelled.to_string()),
                                completed_at: Some(Utc::now()),
                                ..Default::default()
                            })
                            .await?;
                        self.node_status(state, &node.id, "error", None, Some("run was cancelled"));
                        return Err(EngineError::Cancelled);
                    }
                }
            }
            NodeKind::Trigger => ActionResult::ok(json!({})),
        };

        state.ctx.record_output(&node.id, result.clone());

        self.store
            .update_step(
                &step_id,
                StepUpdate {
                    status: Some(if result.success {
                        StepStatus::Completed
                    } else {
                        StepStatus::Failed
                    }),
                    output: result.output.clone(),
                    error: result.error.clone(),
                    completed_at: Some(Utc::now()),
                },
            )
            .await?;

        if !result.success {
            let error = result.error.unwrap_or_else(|| "step failed".to_string());
            tracing::warn!(run_id = %state.run.id, node_id = %node.id, error = %error, "❌ Node failed");
            self.node_status(state, &node.id, "error", result.output.as_ref(), Some(&error));
            return Err(EngineError::StepFailed {
                node_id: node.id.clone(),
                error,
            });
        }

        state.steps_completed = (state.steps_completed + 1).min(state.run.total_steps);
        self.store
            .update_run(
                &state.run.id,
                RunUpdate {
                    steps_completed: Some(state.steps_completed),
                    ..Default::default()
                },
            )
            .await
            .map_err(cancelled_if_finalized)?;

        tracing::debug!(run_id = %state.run.id, node_id = %node.id, "✅ Node completed");
        self.node_status(state, &node.id, "success", result.output.as_ref(), None);
        Ok(branch)
    }

    /// Account for a step completed before an interruption without running it again
    fn replay_step(&self, node: &Node, step: &WorkflowRunStep, state: &mut RunState<'_>) -> Option<Branch> {
        let output = step.output.clone().unwrap_or(Value::Null);
        let branch = match node.kind {
            NodeKind::Condition(_) if output["branch"] == "yes" => Some(Branch::Yes),
            NodeKind::Condition(_) => Some(Branch::No),
            _ => None,
        };
        state.ctx.record_output(&node.id, ActionResult::ok(output));
        state.steps_completed = (state.steps_completed + 1).min(state.run.total_steps);
        tracing::debug!(run_id = %state.run.id, node_id = %node.id, "⏩ Replayed recorded step");
        branch
    }

    async fn finish(
        &self,
        workflow: &Workflow,
        state: &RunState<'_>,
        outcome: Result<(), EngineError>,
    ) -> Result<RunResult, EngineError> {
        let run_id = &state.run.id;
        let (mut status, mut error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(EngineError::Cancelled) => (RunStatus::Cancelled, Some("run cancelled".to_string())),
            Err(e) => {
                tracing::error!(workflow_id = %workflow.id, run_id = %run_id, error = %e, "❌ Workflow run failed");
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        let output = state.ctx.outputs_json();
        if status == RunStatus::Cancelled {
            // Usually already marked by `cancel`; covers cancellation seen first here
            self.store.cancel_run(run_id).await?;
        } else {
            let update = RunUpdate {
                status: Some(status),
                completed_at: Some(Utc::now()),
                error: error.clone(),
                output: Some(output.clone()),
                ..Default::default()
            };
            match self.store.update_run(run_id, update).await {
                Ok(()) => {}
                Err(StoreError::RunFinalized(_)) => {
                    // A cancel landed between the last node and here
                    status = RunStatus::Cancelled;
                    error = Some("run cancelled".to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = self
            .store
            .increment_workflow_run_count(&workflow.id, error.as_deref())
            .await
        {
            tracing::error!(workflow_id = %workflow.id, error = %e, "⚠️ Failed to update workflow run counters");
        }

        let mut complete = json!({
            "runId": run_id,
            "status": status.as_str(),
            "stepsCompleted": state.steps_completed,
            "totalSteps": state.run.total_steps,
        });
        if let Some(error) = &error {
            complete["error"] = json!(error);
        }
        self.publish(state, WORKFLOW_COMPLETE, complete);

        Ok(RunResult {
            success: status == RunStatus::Completed,
            run_id: run_id.clone(),
            workflow_id: workflow.id.clone(),
            status,
            steps_completed: state.steps_completed,
            total_steps: state.run.total_steps,
            output: Some(output),
            error,
        })
    }

    fn node_status(
        &self,
        state: &RunState<'_>,
        node_id: &str,
        status: &str,
        output: Option<&Value>,
        error: Option<&str>,
    ) {
        let mut payload = json!({ "nodeId": node_id, "status": status, "runId": state.run.id });
        if let Some(output) = output {
            payload["output"] = output.clone();
        }
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        self.publish(state, NODE_STATUS, payload);
    }

    fn publish(&self, state: &RunState<'_>, event: &str, payload: Value) {
        self.publisher.publish(&state.run.workflow_id, event, payload);
    }
}

fn cancelled_if_finalized(err: StoreError) -> EngineError {
    match err {
        StoreError::RunFinalized(_) => EngineError::Cancelled,
        other => other.into(),
    }
}
