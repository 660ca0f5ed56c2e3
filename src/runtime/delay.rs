//! Delay node handling
//!
//! Turns a delay node into a durable sleep: a fixed duration, or "until the
//! date found at `dateField` plus `offset` minutes". Dates already in the past
//! resume immediately.

use crate::runtime::durable::DurableSleeper;
use crate::runtime::resolver::lookup;
use crate::workflow::types::{ActionResult, DelaySpec, DelayUnit, ExecutionContext};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use serde_json::{json, Value};

/// Sleep key of the `visit`-th pass through a delay node within a run
///
/// Each pass of a cyclic path gets its own durable sleep; a replayed run
/// walks the same passes in the same order and so finds the same keys.
pub fn sleep_key(run_id: &str, node_id: &str, visit: usize) -> String {
    format!("delay:{run_id}:{node_id}:{visit}")
}

/// Suspend according to `spec` and report the outcome as a step result
pub async fn delay(
    spec: &DelaySpec,
    ctx: &ExecutionContext,
    sleeper: &dyn DurableSleeper,
    key: &str,
) -> ActionResult {
    match spec {
        DelaySpec::Duration { amount, unit } => wait_for(*amount, *unit, sleeper, key).await,
        DelaySpec::Until {
            date_field,
            offset_minutes,
        } => wait_until(date_field, *offset_minutes, ctx, sleeper, key).await,
        DelaySpec::Invalid(error) => ActionResult::failed(error.clone()),
    }
}

async fn wait_for(amount: f64, unit: DelayUnit, sleeper: &dyn DurableSleeper, key: &str) -> ActionResult {
    let Some(duration) = unit.to_duration(amount) else {
        return ActionResult::failed(format!("delay of {amount} {} is out of range", unit.as_str()));
    };

    tracing::info!(key, ?duration, "⏳ Delaying run");
    if let Err(e) = sleeper.sleep(key, duration).await {
        return ActionResult::failed(format!("durable sleep failed: {e}"));
    }

    ActionResult::ok(json!({
        "delayed": { "duration": number(amount), "unit": unit.as_str() },
        "resumedAt": Utc::now().to_rfc3339(),
    }))
}

async fn wait_until(
    date_field: &str,
    offset_minutes: f64,
    ctx: &ExecutionContext,
    sleeper: &dyn DurableSleeper,
    key: &str,
) -> ActionResult {
    let raw = lookup(&format!("triggerData.{date_field}"), ctx).or_else(|| lookup(date_field, ctx));
    let Some(raw) = raw else {
        return ActionResult::failed(format!("delay dateField '{date_field}' did not resolve to a value"));
    };
    let Some(date) = parse_date(&raw) else {
        return ActionResult::failed(format!(
            "delay dateField '{date_field}' value {raw} is not a valid date"
        ));
    };

    let Some(offset) = offset_delta(offset_minutes) else {
        return ActionResult::failed(format!("delay offset of {offset_minutes} minutes is out of range"));
    };
    let Some(target) = date.checked_add_signed(offset) else {
        return ActionResult::failed(format!("delay target for '{date_field}' is out of range"));
    };

    let delayed = json!({
        "until": target.to_rfc3339(),
        "dateField": date_field,
        "offset": number(offset_minutes),
    });

    if target <= Utc::now() {
        tracing::info!(key, target = %target, "⏩ Delay target already passed");
        return ActionResult::ok(json!({
            "delayed": delayed,
            "resumedAt": Utc::now().to_rfc3339(),
            "note": "target time already passed",
        }));
    }

    tracing::info!(key, target = %target, "⏳ Delaying run until target");
    if let Err(e) = sleeper.sleep_until(key, target).await {
        return ActionResult::failed(format!("durable sleep failed: {e}"));
    }

    ActionResult::ok(json!({
        "delayed": delayed,
        "resumedAt": Utc::now().to_rfc3339(),
    }))
}

/// RFC 3339 / `YYYY-MM-DD[ HH:MM:SS]` strings, or epoch seconds/milliseconds
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => from_epoch(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?));
            }
            from_epoch(s.parse().ok()?)
        }
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    // Values this large only make sense as milliseconds
    let millis = if raw.abs() >= 1e11 { raw } else { raw * 1000.0 };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

fn offset_delta(minutes: f64) -> Option<TimeDelta> {
    let millis = (minutes * 60_000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(millis as i64)
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}
