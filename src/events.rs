//! Append-only task event journal.
//!
//! Every transition the engine makes is journalled here; causality for a
//! task is recoverable by scanning its events in insertion order.

use serde_json::{json, Value as JsonValue};
use sqlx::SqlitePool;

use crate::model::{BlockedReason, TaskStatus};
use crate::util::{new_uuid, utc_now_iso};

// Event type tags. Payloads are tag-specific but always JSON objects.
pub const EVENT_STATUS_CHANGED: &str = "STATUS_CHANGED";
pub const EVENT_EVIDENCE_ADDED: &str = "EVIDENCE_ADDED";
pub const EVENT_EVIDENCE_CONFLICT: &str = "EVIDENCE_CONFLICT";
pub const EVENT_ARTIFACT_CREATED: &str = "ARTIFACT_CREATED";
pub const EVENT_REVIEW_CREATED: &str = "REVIEW_CREATED";
pub const EVENT_ERROR: &str = "ERROR";
pub const EVENT_PLAN_REVIEWED: &str = "PLAN_REVIEWED";
pub const EVENT_PLAN_APPROVED: &str = "PLAN_APPROVED";
pub const EVENT_FILE_OBSERVED: &str = "FILE_OBSERVED";
pub const EVENT_FILE_REMOVED: &str = "FILE_REMOVED";
pub const EVENT_WAITING_INPUT: &str = "WAITING_INPUT";
pub const EVENT_INPUT_CONFLICT: &str = "INPUT_CONFLICT";
pub const EVENT_TIMEOUT: &str = "TIMEOUT";
pub const EVENT_BRANCH_CHANGED: &str = "BRANCH_CHANGED";
pub const EVENT_DECOMPOSE_BACKFILL: &str = "REWRITE_DECOMPOSE_BACKFILL";

pub async fn emit_event(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: Option<&str>,
    event_type: &str,
    payload: JsonValue,
) -> anyhow::Result<String> {
    let event_id = new_uuid();
    sqlx::query(
        "INSERT INTO task_events(event_id, plan_id, task_id, event_type, payload_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
    )
    .bind(&event_id)
    .bind(plan_id)
    .bind(task_id)
    .bind(event_type)
    .bind(payload.to_string())
    .bind(utc_now_iso())
    .execute(pool)
    .await?;
    Ok(event_id)
}

/// Write a task status and journal the transition in one place.
pub async fn set_status(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: &str,
    status: TaskStatus,
    blocked_reason: Option<BlockedReason>,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE task_nodes SET status = ?, blocked_reason = ?, updated_at = ? WHERE task_id = ?",
    )
    .bind(status.as_str())
    .bind(blocked_reason.map(|r| r.as_str()))
    .bind(utc_now_iso())
    .bind(task_id)
    .execute(pool)
    .await?;
    emit_event(
        pool,
        plan_id,
        Some(task_id),
        EVENT_STATUS_CHANGED,
        json!({
            "status": status.as_str(),
            "blocked_reason": blocked_reason.map(|r| r.as_str()),
        }),
    )
    .await?;
    Ok(())
}
