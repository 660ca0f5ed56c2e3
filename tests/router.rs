mod common;

use chrono::{TimeDelta, Utc};
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storeflow::runtime::scheduler::DEFAULT_POLL_INTERVAL;
use storeflow::runtime::ScheduledTriggerPoller;
use storeflow::workflow::{RunStatus, WorkflowStore};
use storeflow::EngineError;

fn delayed_email(id: &str, workspace: &str) -> storeflow::Workflow {
    workflow(
        id,
        workspace,
        "order.created",
        json!([
            trigger_node(),
            node("wait", "delay", json!({ "duration": 5, "unit": "minutes" })),
            action_node("email", "email.send", json!({ "label": id })),
        ]),
        json!([edge("trigger", "wait"), edge("wait", "email")]),
    )
}

#[tokio::test]
async fn routes_event_to_every_matching_workflow() {
    let h = Harness::new().await;
    h.save(&single_email("thanks", "ws-1", "order.created", "thanks")).await;
    h.save(&single_email("notify-team", "ws-1", "order.created", "notify-team")).await;
    h.save(&single_email("other-store", "ws-2", "order.created", "other-store")).await;
    h.save(&single_email("refunds", "ws-1", "order.refunded", "refunds")).await;

    let mut paused = single_email("paused", "ws-1", "order.created", "paused");
    paused.is_active = false;
    h.save(&paused).await;
    let mut draft = single_email("draft", "ws-1", "order.created", "draft");
    draft.is_draft = true;
    h.save(&draft).await;

    let outcome = h
        .router
        .route("order.created", "ws-1", json!({ "id": "O1", "total": 42 }))
        .await
        .unwrap();
    assert_eq!(outcome.matched, 2);

    let results = outcome.wait().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == RunStatus::Completed));

    let mut labels = h.calls.labels();
    labels.sort();
    assert_eq!(labels, vec!["notify-team", "thanks"]);

    for result in &results {
        let run = h.store.get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(run.trigger_event, "order.created");
        assert_eq!(run.trigger_payload["id"], "O1");
    }
}

#[tokio::test]
async fn broken_workflows_do_not_stop_valid_ones_on_the_same_event() {
    let h = Harness::new().await;
    h.save(&workflow(
        "dangling",
        "ws-1",
        "order.created",
        json!([trigger_node(), action_node("email", "email.send", json!({ "label": "dangling" }))]),
        json!([edge("trigger", "email"), edge("email", "ghost")]),
    ))
    .await;
    h.save(&workflow(
        "sms",
        "ws-1",
        "order.created",
        json!([trigger_node(), action_node("text", "sms.send", json!({ "to": "+100" }))]),
        json!([edge("trigger", "text")]),
    ))
    .await;
    h.save(&single_email("thanks", "ws-1", "order.created", "thanks")).await;

    let outcome = h.router.route("order.created", "ws-1", json!({ "id": "O1" })).await.unwrap();
    assert_eq!(outcome.matched, 3);

    let results = outcome.wait().await;
    assert_eq!(results.len(), 3);

    let status_of = |id: &str| {
        results
            .iter()
            .find(|r| r.workflow_id == id)
            .map(|r| r.status)
            .unwrap()
    };
    assert_eq!(status_of("thanks"), RunStatus::Completed);
    assert_eq!(status_of("dangling"), RunStatus::Failed);
    assert_eq!(status_of("sms"), RunStatus::Failed);
    assert_eq!(h.calls.labels(), vec!["thanks"]);

    for result in &results {
        let run = h.store.get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, result.status);
        assert!(run.completed_at.is_some());
    }
    let dangling = results.iter().find(|r| r.workflow_id == "dangling").unwrap();
    assert!(dangling.error.as_deref().unwrap().contains("ghost"));
}

#[tokio::test]
async fn event_without_matching_workflows_starts_nothing() {
    let h = Harness::new().await;
    h.save(&single_email("thanks", "ws-1", "order.created", "thanks")).await;

    let results = h
        .router
        .route_and_wait("subscription.cancelled", "ws-1", json!({}))
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(h.calls.len(), 0);
}

#[tokio::test]
async fn runs_beyond_workspace_limit_wait_for_a_slot() {
    let h = Harness::with_options(HarnessOptions {
        workspace_concurrency: 1,
        hold_delays: true,
        ..Default::default()
    })
    .await;
    h.save(&delayed_email("first", "ws-1")).await;
    h.save(&delayed_email("second", "ws-1")).await;
    h.save(&delayed_email("elsewhere", "ws-2")).await;

    let busy = h.router.route("order.created", "ws-1", json!({})).await.unwrap();
    assert_eq!(busy.matched, 2);

    eventually(|| h.sleeper.requests().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.sleeper.requests().len(), 1, "second ws-1 run must queue");
    assert_eq!(h.executor.active_runs(), 1);

    // Another workspace is not held back by ws-1
    let other = h.router.route("order.created", "ws-2", json!({})).await.unwrap();
    eventually(|| h.sleeper.requests().len() == 2).await;

    h.sleeper.release(1);
    eventually(|| h.sleeper.requests().len() == 3).await;
    h.sleeper.release(2);

    let mut results = busy.wait().await;
    results.extend(other.wait().await);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(h.executor.active_runs(), 0);
}

#[tokio::test]
async fn manual_trigger_runs_manual_workflows_only() {
    let h = Harness::new().await;
    h.save(&workflow(
        "resend",
        "ws-1",
        "manual",
        json!([
            trigger_node(),
            action_node(
                "email",
                "email.send",
                json!({ "label": "{{triggerData.triggeredBy}}", "note": "{{note}}" }),
            ),
        ]),
        json!([edge("trigger", "email")]),
    ))
    .await;
    h.save(&single_email("auto", "ws-1", "order.created", "auto")).await;
    let mut draft = single_email("unfinished", "ws-1", "manual", "unfinished");
    draft.is_draft = true;
    h.save(&draft).await;

    let result = h
        .router
        .trigger_manually("resend", "user-7", json!({ "note": "customer asked" }))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    let calls = h.calls.all();
    assert_eq!(calls[0].1["label"], "user-7");
    assert_eq!(calls[0].1["note"], "customer asked");

    let run = h.store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.trigger_event, "manual");
    assert_eq!(run.trigger_payload["triggeredBy"], "user-7");

    let scalar = h.router.trigger_manually("resend", "user-7", json!(5)).await.unwrap();
    let run = h.store.get_run(&scalar.run_id).await.unwrap().unwrap();
    assert_eq!(run.trigger_payload, json!({ "input": 5, "triggeredBy": "user-7" }));

    assert!(matches!(
        h.router.trigger_manually("auto", "user-7", json!({})).await,
        Err(EngineError::NotTriggerable { .. })
    ));
    assert!(matches!(
        h.router.trigger_manually("unfinished", "user-7", json!({})).await,
        Err(EngineError::NotTriggerable { .. })
    ));
    assert!(matches!(
        h.router.trigger_manually("missing", "user-7", json!({})).await,
        Err(EngineError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn poller_fires_only_due_schedule_workflows() {
    let h = Harness::new().await;
    let now = Utc::now();

    let mut never_ran = single_email("hourly", "ws-1", "schedule.interval", "hourly");
    never_ran.trigger_config = json!({ "interval": 30, "unit": "minutes" });
    h.save(&never_ran).await;

    let mut recent = single_email("recent", "ws-2", "schedule.interval", "recent");
    recent.trigger_config = json!({ "intervalMinutes": 30 });
    recent.last_run_at = Some(now - TimeDelta::minutes(5));
    h.save(&recent).await;

    let mut same_minute = single_email("cron", "ws-1", "schedule.cron", "cron");
    same_minute.trigger_config = json!({ "expression": "* * * * *" });
    same_minute.last_run_at = Some(now);
    h.save(&same_minute).await;

    let mut inactive = single_email("inactive", "ws-1", "schedule.interval", "inactive");
    inactive.trigger_config = json!({ "interval": 1 });
    inactive.is_active = false;
    h.save(&inactive).await;

    let poller = ScheduledTriggerPoller::new(
        h.store.clone(),
        Arc::clone(&h.router),
        DEFAULT_POLL_INTERVAL,
    );
    let started = poller.poll_once(now).await.unwrap();
    assert_eq!(started.len(), 1);

    let result = started.into_iter().next().unwrap().await.unwrap().unwrap();
    assert_eq!(result.workflow_id, "hourly");
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(h.calls.labels(), vec!["hourly"]);

    let run = h.store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.trigger_payload["workflowId"], "hourly");
    assert_eq!(run.trigger_payload["triggerType"], "schedule.interval");

    // Having just run, it is no longer due
    let again = poller.poll_once(now).await.unwrap();
    assert!(again.is_empty());
}
