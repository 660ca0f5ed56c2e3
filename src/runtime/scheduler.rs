//! Scheduled trigger poller
//!
//! A repeated tokio-cron-scheduler job wakes on a fixed cadence, finds every
//! active `schedule.interval` / `schedule.cron` workflow and starts a run for
//! those that are due. Due-ness is decided from `lastRunAt` only; the poller
//! never looks at run history and never executes workflow logic itself.

use crate::error::EngineError;
use crate::runtime::engine::RunResult;
use crate::runtime::router::TriggerRouter;
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{DelayUnit, Workflow, SCHEDULE_CRON, SCHEDULE_INTERVAL};
use anyhow::Result;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

pub struct ScheduledTriggerPoller {
    store: Arc<dyn WorkflowStore>,
    router: Arc<TriggerRouter>,
    cadence: Duration,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl ScheduledTriggerPoller {
    pub fn new(store: Arc<dyn WorkflowStore>, router: Arc<TriggerRouter>, cadence: Duration) -> Self {
        Self {
            store,
            router,
            cadence,
            scheduler: Mutex::new(None),
        }
    }

    /// Register the repeated poll job and start the scheduler
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        tracing::info!("⏰ Starting schedule poller (every {:?})", self.cadence);
        let scheduler = JobScheduler::new().await?;

        let poller = Arc::clone(self);
        let job = Job::new_repeated_async(self.cadence, move |_uuid, _l| {
            let poller = Arc::clone(&poller);
            Box::pin(async move {
                poller.tick().await;
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        *guard = Some(scheduler);

        // The repeated job first fires one cadence from now
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.tick().await });

        tracing::info!("✅ Schedule poller started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            tracing::info!("⏹️ Stopping schedule poller");
            scheduler.shutdown().await?;
        }
        Ok(())
    }

    async fn tick(&self) {
        match self.poll_once(Utc::now()).await {
            Ok(started) if !started.is_empty() => {
                tracing::info!(fired = started.len(), "🔔 Scheduled workflows fired");
            }
            Ok(_) => tracing::debug!("🔕 No scheduled workflows due"),
            Err(e) => tracing::error!(error = %e, "❌ Schedule poll failed"),
        }
    }

    /// Check every schedule-triggered workflow once and start the due ones
    pub async fn poll_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinHandle<Result<RunResult, EngineError>>>, EngineError> {
        let workflows = self.store.find_active_schedule_workflows().await?;

        let mut started = Vec::new();
        for workflow in workflows {
            if !is_due(&workflow, now) {
                continue;
            }
            tracing::info!(
                workflow_id = %workflow.id,
                trigger = %workflow.trigger,
                "🔔 Scheduled workflow due"
            );
            let payload = json!({
                "scheduledAt": now.to_rfc3339(),
                "workflowId": workflow.id,
                "triggerType": workflow.trigger,
            });
            started.push(self.router.start_workflow(workflow, payload));
        }
        Ok(started)
    }
}

/// Whether a schedule-triggered workflow should fire at `now`
pub fn is_due(workflow: &Workflow, now: DateTime<Utc>) -> bool {
    match workflow.trigger.as_str() {
        SCHEDULE_INTERVAL => {
            let Some(last) = workflow.last_run_at else {
                return true;
            };
            let Some(interval) = interval_of(&workflow.trigger_config) else {
                tracing::warn!(workflow_id = %workflow.id, "⚠️ Interval trigger has no valid interval");
                return false;
            };
            now - last >= interval
        }
        // Coarse check: fires once per distinct minute, not per cron expression
        SCHEDULE_CRON => match workflow.last_run_at {
            None => true,
            Some(last) => minute_of(last) != minute_of(now),
        },
        _ => false,
    }
}

/// `{interval, unit}` (unit defaults to minutes) or `{intervalMinutes}`
fn interval_of(config: &Value) -> Option<TimeDelta> {
    let (amount, unit) = if let Some(minutes) = config.get("intervalMinutes") {
        (number(minutes)?, DelayUnit::Minutes)
    } else {
        let amount = number(config.get("interval")?)?;
        let unit = match config.get("unit").and_then(Value::as_str) {
            Some(unit) => unit.parse().ok()?,
            None => DelayUnit::Minutes,
        };
        (amount, unit)
    };
    if amount <= 0.0 {
        return None;
    }
    TimeDelta::from_std(unit.to_duration(amount)?).ok()
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn minute_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts)
}
