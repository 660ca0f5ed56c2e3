//! SQLite persistence layer
//!
//! `WorkflowStore` is the narrow persistence interface the engine depends on;
//! `SqliteStore` implements it with sqlx. Workflow definitions are stored as
//! JSON next to the indexed lookup columns (workspace, trigger, flags) and the
//! run counters the engine updates. Runs and steps are run-scoped rows.

use crate::error::StoreError;
use crate::workflow::types::{
    NewRun, NewStep, RunStatus, RunUpdate, StepStatus, StepUpdate, Workflow, WorkflowRun,
    WorkflowRunStep, SCHEDULE_CRON, SCHEDULE_INTERVAL,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Persistence operations used by the executor, router and poller
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or update a workflow definition (run counters are left alone on update)
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;

    /// Active, non-draft workflows of a workspace with the given trigger
    async fn find_active_by_trigger(
        &self,
        trigger: &str,
        workspace_id: &str,
    ) -> Result<Vec<Workflow>, StoreError>;

    /// Active, non-draft workflows with a `schedule.*` trigger, across workspaces
    async fn find_active_schedule_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Bump `run_count`, stamp `last_run_at` and set (or clear) `last_error`
    async fn increment_workflow_run_count(
        &self,
        workflow_id: &str,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn create_run(&self, run: NewRun) -> Result<WorkflowRun, StoreError>;

    /// Update a running run; fails with `RunFinalized` once the run is terminal
    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    /// Runs still marked `running`, oldest first (used to recover after a restart)
    async fn find_running_runs(&self) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Mark a running run cancelled; `false` if it was already terminal
    async fn cancel_run(&self, run_id: &str) -> Result<bool, StoreError>;

    async fn create_step(&self, step: NewStep) -> Result<WorkflowRunStep, StoreError>;

    async fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<(), StoreError>;

    /// Steps of a run in the order they were started
    async fn list_steps(&self, run_id: &str) -> Result<Vec<WorkflowRunStep>, StoreError>;
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url` and initialize the schema
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes. Safe to call repeatedly (IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_draft INTEGER NOT NULL DEFAULT 0,
                run_count INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                last_error TEXT,
                definition JSON NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflows_trigger
            ON workflows(workspace_id, trigger_type, is_active, is_draft)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                trigger_event TEXT NOT NULL,
                trigger_payload JSON NOT NULL,
                status TEXT NOT NULL,
                total_steps INTEGER NOT NULL,
                steps_completed INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                error TEXT,
                output JSON
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_workflow ON workflow_runs(workflow_id, started_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_run_steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                resolved_config JSON NOT NULL,
                status TEXT NOT NULL,
                input JSON NOT NULL,
                output JSON,
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_run ON workflow_run_steps(run_id, seq)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS durable_sleeps (
                key TEXT PRIMARY KEY,
                wake_at TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let definition = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, workspace_id, name, trigger_type, is_active, is_draft,
                run_count, last_run_at, last_error, definition, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                name = excluded.name,
                trigger_type = excluded.trigger_type,
                is_active = excluded.is_active,
                is_draft = excluded.is_draft,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.workspace_id)
        .bind(&workflow.name)
        .bind(&workflow.trigger)
        .bind(workflow.is_active)
        .bind(workflow.is_draft)
        .bind(workflow.run_count)
        .bind(workflow.last_run_at.map(format_ts))
        .bind(&workflow.last_error)
        .bind(&definition)
        .bind(format_ts(workflow.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query(&format!("{WORKFLOW_SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn find_active_by_trigger(
        &self,
        trigger: &str,
        workspace_id: &str,
    ) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(&format!(
            "{WORKFLOW_SELECT} WHERE trigger_type = ? AND workspace_id = ? \
             AND is_active = 1 AND is_draft = 0 ORDER BY id"
        ))
        .bind(trigger)
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn find_active_schedule_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(&format!(
            "{WORKFLOW_SELECT} WHERE trigger_type IN (?, ?) \
             AND is_active = 1 AND is_draft = 0 ORDER BY id"
        ))
        .bind(SCHEDULE_CRON)
        .bind(SCHEDULE_INTERVAL)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn increment_workflow_run_count(
        &self,
        workflow_id: &str,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflows SET run_count = run_count + 1, last_run_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(format_ts(Utc::now()))
        .bind(last_error)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_run(&self, run: NewRun) -> Result<WorkflowRun, StoreError> {
        let record = WorkflowRun {
            id: Uuid::new_v4().to_string(),
            workflow_id: run.workflow_id,
            workspace_id: run.workspace_id,
            trigger_event: run.trigger_event,
            trigger_payload: run.trigger_payload,
            status: RunStatus::Running,
            total_steps: run.total_steps,
            steps_completed: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            output: None,
        };

        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, workflow_id, workspace_id, trigger_event, trigger_payload,
                status, total_steps, steps_completed, started_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workflow_id)
        .bind(&record.workspace_id)
        .bind(&record.trigger_event)
        .bind(serde_json::to_string(&record.trigger_payload)?)
        .bind(record.status.as_str())
        .bind(record.total_steps)
        .bind(format_ts(record.started_at))
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<(), StoreError> {
        let output = update.output.as_ref().map(serde_json::to_string).transpose()?;

        // Terminal runs are immutable; steps_completed is clamped to total_steps
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs SET
                status = COALESCE(?, status),
                steps_completed = MIN(COALESCE(?, steps_completed), total_steps),
                completed_at = COALESCE(?, completed_at),
                error = COALESCE(?, error),
                output = COALESCE(?, output)
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(update.status.map(RunStatus::as_str))
        .bind(update.steps_completed)
        .bind(update.completed_at.map(format_ts))
        .bind(&update.error)
        .bind(output)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_run(run_id).await? {
                Some(_) => Err(StoreError::RunFinalized(run_id.to_string())),
                None => Err(StoreError::NotFound {
                    entity: "run",
                    id: run_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, workspace_id, trigger_event, trigger_payload, status,
                   total_steps, steps_completed, started_at, completed_at, error, output
            FROM workflow_runs WHERE id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn find_running_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, workspace_id, trigger_event, trigger_payload, status,
                   total_steps, steps_completed, started_at, completed_at, error, output
            FROM workflow_runs WHERE status = 'running' ORDER BY started_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn cancel_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(format_ts(Utc::now()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_step(&self, step: NewStep) -> Result<WorkflowRunStep, StoreError> {
        let record = WorkflowRunStep {
            id: Uuid::new_v4().to_string(),
            run_id: step.run_id,
            node_id: step.node_id,
            action_type: step.action_type,
            resolved_config: step.resolved_config,
            status: StepStatus::Running,
            input: step.input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO workflow_run_steps (
                id, run_id, seq, node_id, action_type, resolved_config, status, input, started_at
            )
            VALUES (
                ?, ?,
                (SELECT COUNT(*) FROM workflow_run_steps WHERE run_id = ?),
                ?, ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&record.id)
        .bind(&record.run_id)
        .bind(&record.run_id)
        .bind(&record.node_id)
        .bind(&record.action_type)
        .bind(serde_json::to_string(&record.resolved_config)?)
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.input)?)
        .bind(format_ts(record.started_at))
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<(), StoreError> {
        let output = update.output.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_run_steps SET
                status = COALESCE(?, status),
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(StepStatus::as_str))
        .bind(output)
        .bind(&update.error)
        .bind(update.completed_at.map(format_ts))
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "step",
                id: step_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<WorkflowRunStep>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, node_id, action_type, resolved_config, status, input,
                   output, error, started_at, completed_at
            FROM workflow_run_steps WHERE run_id = ? ORDER BY seq
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

const WORKFLOW_SELECT: &str = "SELECT is_active, is_draft, run_count, last_run_at, last_error, \
                               definition, updated_at FROM workflows";

/// Definition JSON plus the authoritative column values
fn workflow_from_row(row: &SqliteRow) -> Result<Workflow, StoreError> {
    let definition: String = row.try_get("definition")?;
    let mut workflow: Workflow = serde_json::from_str(&definition)?;

    workflow.is_active = row.try_get("is_active")?;
    workflow.is_draft = row.try_get("is_draft")?;
    workflow.run_count = row.try_get("run_count")?;
    workflow.last_run_at = parse_optional_ts(row.try_get("last_run_at")?)?;
    workflow.last_error = row.try_get("last_error")?;
    workflow.updated_at = parse_ts(&row.try_get::<String, _>("updated_at")?)?;

    Ok(workflow)
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(WorkflowRun {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        workspace_id: row.try_get("workspace_id")?,
        trigger_event: row.try_get("trigger_event")?,
        trigger_payload: parse_json(&row.try_get::<String, _>("trigger_payload")?)?,
        status: status.parse().map_err(StoreError::Status)?,
        total_steps: row.try_get("total_steps")?,
        steps_completed: row.try_get("steps_completed")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        completed_at: parse_optional_ts(row.try_get("completed_at")?)?,
        error: row.try_get("error")?,
        output: parse_optional_json(row.try_get("output")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowRunStep, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(WorkflowRunStep {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        action_type: row.try_get("action_type")?,
        resolved_config: parse_json(&row.try_get::<String, _>("resolved_config")?)?,
        status: status.parse().map_err(StoreError::Status)?,
        input: parse_json(&row.try_get::<String, _>("input")?)?,
        output: parse_optional_json(row.try_get("output")?)?,
        error: row.try_get("error")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        completed_at: parse_optional_ts(row.try_get("completed_at")?)?,
    })
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}

fn parse_optional_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_json(raw: &str) -> Result<Value, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn parse_optional_json(raw: Option<String>) -> Result<Option<Value>, StoreError> {
    raw.as_deref().map(parse_json).transpose()
}
