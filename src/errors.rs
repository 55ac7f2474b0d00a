//! Error taxonomy and the code → task-outcome mapping table.

use serde_json::{json, Value as JsonValue};
use sqlx::SqlitePool;

use crate::events::{emit_event, set_status, EVENT_ERROR};
use crate::model::{BlockedReason, TaskStatus};
use crate::util::utc_now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    LlmUnparseable,
    LlmTimeout,
    LlmRefusal,
    LlmFailed,
    SkillFailed,
    SkillTimeout,
    SkillBadInput,
    InputConflict,
    InputMissing,
    MaxAttemptsExceeded,
    PlanTimeout,
    PlanInvalid,
    PlanNotApproved,
    MaxLlmCallsExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::LlmUnparseable => "LLM_UNPARSEABLE",
            ErrorCode::LlmTimeout => "LLM_TIMEOUT",
            ErrorCode::LlmRefusal => "LLM_REFUSAL",
            ErrorCode::LlmFailed => "LLM_FAILED",
            ErrorCode::SkillFailed => "SKILL_FAILED",
            ErrorCode::SkillTimeout => "SKILL_TIMEOUT",
            ErrorCode::SkillBadInput => "SKILL_BAD_INPUT",
            ErrorCode::InputConflict => "INPUT_CONFLICT",
            ErrorCode::InputMissing => "INPUT_MISSING",
            ErrorCode::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            ErrorCode::PlanTimeout => "PLAN_TIMEOUT",
            ErrorCode::PlanInvalid => "PLAN_INVALID",
            ErrorCode::PlanNotApproved => "PLAN_NOT_APPROVED",
            ErrorCode::MaxLlmCallsExceeded => "MAX_LLM_CALLS_EXCEEDED",
        }
    }

    /// Short user-facing hint naming the canonical next step.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorCode::LlmUnparseable => {
                "The model response did not match the contract; it will be retried on the next attempt."
            }
            ErrorCode::LlmTimeout => "The model call timed out; raise llm.timeout_s or retry.",
            ErrorCode::LlmRefusal => "The model refused; rephrase the task or provide context, then reset-failed.",
            ErrorCode::LlmFailed => "The model transport failed; check connectivity and retry.",
            ErrorCode::SkillFailed => "A tool failed; inspect the skill_runs row and retry.",
            ErrorCode::SkillTimeout => "A tool exceeded its budget; raise skill_timeout_seconds.",
            ErrorCode::SkillBadInput => "A tool input is missing; place the file under workspace/inputs/.",
            ErrorCode::InputConflict => {
                "Multiple versions exist for one requirement; keep one (or name it FINAL) and re-run."
            }
            ErrorCode::InputMissing => {
                "Required evidence is absent; see required_docs/<task_id>.md for what to provide."
            }
            ErrorCode::MaxAttemptsExceeded => {
                "Attempt cap reached; review suggestions, then reset-failed to retry."
            }
            ErrorCode::PlanTimeout => "Wall-clock fuse tripped; re-run to continue.",
            ErrorCode::PlanInvalid => "Generated plan violates invariants; re-run create-plan.",
            ErrorCode::PlanNotApproved => "The reviewer never approved a plan; re-run create-plan.",
            ErrorCode::MaxLlmCallsExceeded => "Total call fuse tripped; re-run to continue.",
        }
    }
}

/// Where a task lands after an error, and how the attempt counter moves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorOutcome {
    pub status: Option<TaskStatus>,
    pub blocked_reason: Option<BlockedReason>,
    pub attempt_delta: i64,
}

/// The §7 mapping table. Codes that stop the loop (PLAN_TIMEOUT etc.) map to
/// no task transition; the engine handles them at the loop level.
pub fn map_error_to_outcome(code: ErrorCode) -> ErrorOutcome {
    match code {
        ErrorCode::LlmUnparseable | ErrorCode::LlmTimeout | ErrorCode::LlmFailed => ErrorOutcome {
            status: Some(TaskStatus::Failed),
            blocked_reason: None,
            attempt_delta: 1,
        },
        ErrorCode::LlmRefusal => ErrorOutcome {
            status: Some(TaskStatus::Failed),
            blocked_reason: None,
            attempt_delta: 1,
        },
        ErrorCode::SkillFailed | ErrorCode::SkillTimeout => ErrorOutcome {
            status: Some(TaskStatus::Blocked),
            blocked_reason: Some(BlockedReason::WaitingSkill),
            attempt_delta: 0,
        },
        ErrorCode::SkillBadInput | ErrorCode::InputMissing => ErrorOutcome {
            status: Some(TaskStatus::Blocked),
            blocked_reason: Some(BlockedReason::WaitingInput),
            attempt_delta: 0,
        },
        ErrorCode::InputConflict | ErrorCode::MaxAttemptsExceeded => ErrorOutcome {
            status: Some(TaskStatus::Blocked),
            blocked_reason: Some(BlockedReason::WaitingExternal),
            attempt_delta: 0,
        },
        ErrorCode::PlanTimeout
        | ErrorCode::PlanInvalid
        | ErrorCode::PlanNotApproved
        | ErrorCode::MaxLlmCallsExceeded => ErrorOutcome::default(),
    }
}

/// Journal a structured error event, with a hint and optional LlmCall link.
pub async fn record_error(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: Option<&str>,
    code: ErrorCode,
    message: &str,
    context: JsonValue,
) -> anyhow::Result<()> {
    emit_event(
        pool,
        plan_id,
        task_id,
        EVENT_ERROR,
        json!({
            "error_code": code.as_str(),
            "message": message,
            "hint": code.hint(),
            "context": context,
        }),
    )
    .await?;
    Ok(())
}

pub async fn apply_error_outcome(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: &str,
    outcome: ErrorOutcome,
) -> anyhow::Result<()> {
    if outcome.attempt_delta != 0 {
        sqlx::query(
            "UPDATE task_nodes SET attempt_count = attempt_count + ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(outcome.attempt_delta)
        .bind(utc_now_iso())
        .bind(task_id)
        .execute(pool)
        .await?;
    }
    if let Some(status) = outcome.status {
        set_status(pool, plan_id, task_id, status, outcome.blocked_reason).await?;
    }
    Ok(())
}

/// Record an error and apply its outcome in one step.
pub async fn handle_error(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: Option<&str>,
    code: ErrorCode,
    message: &str,
    context: JsonValue,
) -> anyhow::Result<()> {
    record_error(pool, plan_id, task_id, code, message, context).await?;
    if let Some(task_id) = task_id {
        apply_error_outcome(pool, plan_id, task_id, map_error_to_outcome(code)).await?;
    }
    Ok(())
}

/// Optional recovery: reset FAILED -> READY when config allows it. Only
/// toggles status; evidence and history stay intact.
pub async fn maybe_reset_failed_to_ready(
    pool: &SqlitePool,
    plan_id: &str,
    enabled: bool,
) -> anyhow::Result<u64> {
    if !enabled {
        return Ok(0);
    }
    let rows = sqlx::query(
        "SELECT task_id FROM task_nodes WHERE plan_id = ? AND active_branch = 1 AND status = 'FAILED'",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    let count = rows.len() as u64;
    for row in rows {
        let task_id: String = sqlx::Row::get(&row, "task_id");
        set_status(pool, plan_id, &task_id, TaskStatus::Ready, None).await?;
    }
    Ok(count)
}
