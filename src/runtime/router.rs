//! Trigger routing
//!
//! An inbound event starts one run for every active, published workflow of
//! the event's workspace whose trigger matches. Runs are spawned on the tokio
//! runtime and never awaited by `route`; each workspace has a semaphore that
//! caps how many of its runs execute at once, the rest wait for a permit.

use crate::error::EngineError;
use crate::runtime::engine::{GraphExecutor, RunResult};
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{Workflow, MANUAL_TRIGGER};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const DEFAULT_WORKSPACE_CONCURRENCY: usize = 5;

/// Runs started for one event
#[derive(Debug)]
pub struct RouteOutcome {
    pub matched: usize,
    pub runs: Vec<JoinHandle<Result<RunResult, EngineError>>>,
}

impl RouteOutcome {
    /// Wait for every started run; runs that could not be recorded are logged and left out
    pub async fn wait(self) -> Vec<RunResult> {
        let mut results = Vec::with_capacity(self.runs.len());
        for handle in self.runs {
            match handle.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => tracing::error!(error = %e, "❌ Run could not be executed"),
                Err(e) => tracing::error!(error = %e, "💥 Run task aborted"),
            }
        }
        results
    }
}

pub struct TriggerRouter {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<GraphExecutor>,
    /// Key: workspace id
    limits: DashMap<String, Arc<Semaphore>>,
    workspace_concurrency: usize,
}

impl TriggerRouter {
    pub fn new(store: Arc<dyn WorkflowStore>, executor: Arc<GraphExecutor>, workspace_concurrency: usize) -> Self {
        Self {
            store,
            executor,
            limits: DashMap::new(),
            workspace_concurrency: workspace_concurrency.max(1),
        }
    }

    pub fn executor(&self) -> &Arc<GraphExecutor> {
        &self.executor
    }

    /// Start a run for every workflow matching the event; returns without waiting for them
    pub async fn route(
        &self,
        trigger_type: &str,
        workspace_id: &str,
        payload: Value,
    ) -> Result<RouteOutcome, EngineError> {
        let workflows = self.store.find_active_by_trigger(trigger_type, workspace_id).await?;

        if workflows.is_empty() {
            tracing::debug!(trigger_type, workspace_id, "📭 No workflows matched event");
            return Ok(RouteOutcome { matched: 0, runs: Vec::new() });
        }

        tracing::info!(
            trigger_type,
            workspace_id,
            matched = workflows.len(),
            "📨 Routing event to matching workflows"
        );

        let matched = workflows.len();
        let runs = workflows
            .into_iter()
            .map(|workflow| self.start_workflow(workflow, payload.clone()))
            .collect();

        Ok(RouteOutcome { matched, runs })
    }

    /// Route and wait for every started run to finish
    pub async fn route_and_wait(
        &self,
        trigger_type: &str,
        workspace_id: &str,
        payload: Value,
    ) -> Result<Vec<RunResult>, EngineError> {
        Ok(self.route(trigger_type, workspace_id, payload).await?.wait().await)
    }

    /// Spawn a run of one specific workflow under its workspace's concurrency limit
    pub fn start_workflow(&self, workflow: Workflow, payload: Value) -> JoinHandle<Result<RunResult, EngineError>> {
        let workspace_id = workflow.workspace_id.clone();
        self.spawn_limited(&workspace_id, move |executor| async move {
            let result = executor.execute(&workflow, payload).await;
            if let Err(e) = &result {
                tracing::error!(workflow_id = %workflow.id, error = %e, "❌ Failed to start workflow run");
            }
            result
        })
    }

    /// Resume every run a previous process left `running`
    ///
    /// Each resumed run queues behind its workspace's concurrency limit like a
    /// freshly routed one.
    pub async fn resume_interrupted(&self) -> Result<Vec<JoinHandle<Result<RunResult, EngineError>>>, EngineError> {
        let runs = self.store.find_running_runs().await?;
        if runs.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(count = runs.len(), "♻️ Resuming interrupted runs");
        Ok(runs
            .into_iter()
            .map(|run| {
                let workspace_id = run.workspace_id.clone();
                self.spawn_limited(&workspace_id, move |executor| async move {
                    let run_id = run.id.clone();
                    let result = executor.resume(run).await;
                    if let Err(e) = &result {
                        tracing::error!(run_id = %run_id, error = %e, "❌ Failed to resume workflow run");
                    }
                    result
                })
            })
            .collect())
    }

    fn spawn_limited<F, Fut>(&self, workspace_id: &str, run: F) -> JoinHandle<Result<RunResult, EngineError>>
    where
        F: FnOnce(Arc<GraphExecutor>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<RunResult, EngineError>> + Send + 'static,
    {
        let semaphore = self.workspace_limit(workspace_id);
        let executor = Arc::clone(&self.executor);
        let workspace_id = workspace_id.to_string();

        tokio::spawn(async move {
            if semaphore.available_permits() == 0 {
                tracing::debug!(workspace_id = %workspace_id, "⏸️ Workspace at concurrency limit, queueing run");
            }
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| EngineError::RunAborted(e.to_string()))?;

            run(executor).await
        })
    }

    /// Run a `manual` workflow directly and wait for its result
    pub async fn trigger_manually(
        &self,
        workflow_id: &str,
        triggered_by: &str,
        input: Value,
    ) -> Result<RunResult, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let reason = if !workflow.is_active {
            Some("workflow is not active".to_string())
        } else if workflow.is_draft {
            Some("workflow is a draft".to_string())
        } else if workflow.trigger != MANUAL_TRIGGER {
            Some(format!("trigger is '{}', not '{MANUAL_TRIGGER}'", workflow.trigger))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(EngineError::NotTriggerable {
                workflow_id: workflow_id.to_string(),
                reason,
            });
        }

        let mut payload = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        payload.insert("triggeredBy".to_string(), json!(triggered_by));

        tracing::info!(workflow_id, triggered_by, "👆 Manual trigger");
        self.start_workflow(workflow, Value::Object(payload))
            .await
            .map_err(|e| EngineError::RunAborted(e.to_string()))?
    }

    pub async fn cancel(&self, run_id: &str) -> Result<bool, EngineError> {
        self.executor.cancel(run_id).await
    }

    fn workspace_limit(&self, workspace_id: &str) -> Arc<Semaphore> {
        self.limits
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.workspace_concurrency)))
            .clone()
    }
}
