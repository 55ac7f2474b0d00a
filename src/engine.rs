//! The main run loop.
//!
//! Single writer, one tick at a time, fixed order within a tick:
//! scan inputs → recompute readiness → pick → executor xor reviewer →
//! persist/emit → advance. Three fuses (wall clock, total LM calls, run
//! iterations) terminate the loop cleanly; quiescing with blocked tasks
//! writes a human-readable summary and stops.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::errors::{maybe_reset_failed_to_ready, record_error, ErrorCode};
use crate::events::{emit_event, EVENT_TIMEOUT};
use crate::executor::run_executor_phase;
use crate::guardrails::{FuseTrip, Guardrails};
use crate::matcher::{detect_removed_input_files, scan_inputs_and_bind_evidence};
use crate::readiness::recompute_readiness_for_plan;
use crate::reviewer::run_reviewer_phase;
use crate::scheduler::{pick_next_action, pick_review_tasks};

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Root GOAL reached DONE.
    PlanDone,
    /// No runnable work; blocked tasks wait on the user. The summary path
    /// names what is missing.
    BlockedWaitingUser(PathBuf),
    /// A fuse tripped; re-running continues from persisted state.
    FuseTripped(FuseTrip),
}

pub async fn run_plan(ctx: &EngineContext, plan_id: &str) -> anyhow::Result<RunOutcome> {
    let pool = ctx.pool();
    let mut guardrails = Guardrails::new(&ctx.config);

    loop {
        if let Some(trip) = guardrails.begin_tick() {
            return handle_fuse_trip(pool, plan_id, trip, &guardrails).await;
        }

        // Fixed tick order.
        scan_inputs_and_bind_evidence(pool, plan_id, &ctx.workspace.inputs_dir()).await?;
        detect_removed_input_files(pool, plan_id, &ctx.workspace.inputs_dir()).await?;
        maybe_reset_failed_to_ready(pool, plan_id, ctx.config.failed_auto_reset_ready).await?;
        recompute_readiness_for_plan(pool, plan_id).await?;

        write_required_docs_for_blocked(ctx, plan_id).await?;

        // One phase per tick: pending reviews gate new executor work.
        let mut worked = false;
        let reviews = pick_review_tasks(pool, plan_id, 1).await?;
        if let Some(task) = reviews.into_iter().next() {
            run_reviewer_phase(ctx, &mut guardrails, &task).await?;
            worked = true;
        } else if let Some(task) = pick_next_action(pool, plan_id).await? {
            run_executor_phase(ctx, &mut guardrails, &task).await?;
            worked = true;
        }

        // Stop conditions are evaluated on a fresh sweep so transitions made
        // by the phase above (e.g. a final DONE) are reflected.
        recompute_readiness_for_plan(pool, plan_id).await?;
        if ctx.store.is_plan_done(plan_id).await? {
            info!(plan_id, "plan complete");
            return Ok(RunOutcome::PlanDone);
        }
        if is_plan_blocked_waiting_user(pool, plan_id).await? {
            let summary = write_blocked_summary(ctx, plan_id).await?;
            warn!(plan_id, summary = %summary.display(), "plan blocked waiting for the user");
            return Ok(RunOutcome::BlockedWaitingUser(summary));
        }

        if !worked {
            tokio::time::sleep(Duration::from_secs(ctx.config.poll_interval_seconds)).await;
        }
    }
}

async fn handle_fuse_trip(
    pool: &SqlitePool,
    plan_id: &str,
    trip: FuseTrip,
    guardrails: &Guardrails,
) -> anyhow::Result<RunOutcome> {
    emit_event(
        pool,
        plan_id,
        None,
        EVENT_TIMEOUT,
        json!({"scope": trip.scope(), "llm_calls": guardrails.llm_calls()}),
    )
    .await?;
    let code = match trip {
        FuseTrip::LlmCalls => ErrorCode::MaxLlmCallsExceeded,
        FuseTrip::Plan | FuseTrip::Iterations => ErrorCode::PlanTimeout,
    };
    record_error(
        pool,
        plan_id,
        None,
        code,
        &format!("fuse tripped: {}", trip.scope()),
        json!({"scope": trip.scope()}),
    )
    .await?;
    warn!(plan_id, scope = trip.scope(), "fuse tripped; loop stopped cleanly");
    Ok(RunOutcome::FuseTripped(trip))
}

/// Tasks blocked on declared-but-missing requirements get a
/// `required_docs/<task_id>.md` note derived from the requirement rows, so
/// the user learns what to provide without an LM round trip.
async fn write_required_docs_for_blocked(ctx: &EngineContext, plan_id: &str) -> anyhow::Result<()> {
    let pool = ctx.pool();
    let blocked = sqlx::query(
        "SELECT task_id FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1
           AND status = 'BLOCKED' AND blocked_reason = 'WAITING_INPUT'",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    for row in blocked {
        let task_id: String = row.get::<String, _>("task_id");
        let path = ctx.workspace.required_docs_dir().join(format!("{}.md", task_id));
        if path.exists() {
            continue;
        }

        let reqs = sqlx::query(
            "SELECT requirement_id, name, min_count, allowed_types_json
             FROM input_requirements WHERE task_id = ? AND required = 1",
        )
        .bind(&task_id)
        .fetch_all(pool)
        .await?;

        let mut lines = vec![
            format!("# Required docs for task {}", task_id),
            String::new(),
            "Place each file under `inputs/<requirement_name>/` and re-run.".to_string(),
            String::new(),
        ];
        let mut missing_any = false;
        for req in reqs {
            let requirement_id: String = req.get("requirement_id");
            let name: String = req.get("name");
            let min_count: i64 = req.get("min_count");
            let have: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM evidences WHERE requirement_id = ?")
                    .bind(&requirement_id)
                    .fetch_one(pool)
                    .await?;
            if have >= min_count {
                continue;
            }
            missing_any = true;
            let allowed: Vec<String> =
                serde_json::from_str(&req.get::<String, _>("allowed_types_json")).unwrap_or_default();
            lines.push(format!("- {}: need {} file(s), have {}", name, min_count, have));
            if !allowed.is_empty() {
                lines.push(format!("  - accepted_types: {}", allowed.join(", ")));
            }
            lines.push(format!("  - suggested_path: inputs/{}/", name));
        }
        if missing_any {
            lines.push(String::new());
            tokio::fs::create_dir_all(ctx.workspace.required_docs_dir()).await?;
            tokio::fs::write(&path, lines.join("\n")).await?;
        }
    }
    Ok(())
}

/// True when nothing is runnable and at least one task waits on the user
/// (missing input or external intervention).
pub async fn is_plan_blocked_waiting_user(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<bool> {
    let runnable: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1 AND node_type = 'ACTION'
           AND status IN ('READY', 'TO_BE_MODIFY', 'READY_TO_CHECK', 'IN_PROGRESS')",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await?;
    if runnable > 0 {
        return Ok(false);
    }
    let blocked: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1 AND status = 'BLOCKED'
           AND blocked_reason IN ('WAITING_INPUT', 'WAITING_SKILL', 'WAITING_EXTERNAL')",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await?;
    Ok(blocked > 0)
}

/// `required_docs/blocked_summary.md`: per blocked task, what is missing and
/// the canonical next step.
pub async fn write_blocked_summary(ctx: &EngineContext, plan_id: &str) -> anyhow::Result<PathBuf> {
    let pool = ctx.pool();
    let rows = sqlx::query(
        "SELECT task_id, title, blocked_reason, attempt_count, owner_agent_id
         FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1 AND status = 'BLOCKED'
         ORDER BY priority DESC, task_id ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let mut lines = vec![
        format!("# Blocked summary ({})", plan_id),
        String::new(),
        format!("- ts: {}", crate::util::utc_now_iso()),
        "- how to resume: add files under inputs/<requirement_name>/, or run reset-failed".to_string(),
        String::new(),
    ];

    for row in rows {
        let task_id: String = row.get("task_id");
        let title: String = row.get("title");
        let blocked_reason: Option<String> = row.get("blocked_reason");
        let attempts: i64 = row.get("attempt_count");
        let owner: String = row.get("owner_agent_id");
        lines.push(format!(
            "- {} ({}, attempts={}, owner={}): {}",
            task_id,
            blocked_reason.as_deref().unwrap_or("-"),
            attempts,
            owner,
            title
        ));

        let docs_path = ctx.workspace.required_docs_dir().join(format!("{}.md", task_id));
        if docs_path.exists() {
            lines.push(format!("  - required_docs: {}", docs_path.display()));
        }

        // Missing requirement counts.
        let reqs = sqlx::query(
            "SELECT requirement_id, name, required, min_count FROM input_requirements WHERE task_id = ?",
        )
        .bind(&task_id)
        .fetch_all(pool)
        .await?;
        let mut missing = Vec::new();
        for req in reqs {
            if req.get::<i64, _>("required") == 0 {
                continue;
            }
            let requirement_id: String = req.get("requirement_id");
            let min_count: i64 = req.get("min_count");
            let have: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM evidences WHERE requirement_id = ?")
                    .bind(&requirement_id)
                    .fetch_one(pool)
                    .await?;
            if have < min_count {
                missing.push(format!(
                    "{} (need {}, have {})",
                    req.get::<String, _>("name"),
                    min_count,
                    have
                ));
            }
        }
        if !missing.is_empty() {
            lines.push("  - missing_requirements:".to_string());
            for item in missing.iter().take(20) {
                lines.push(format!("    - {}", item));
            }
        }

        // The last review of the task's current artifact, if one exists.
        let active_artifact: Option<String> =
            sqlx::query_scalar("SELECT active_artifact_id FROM task_nodes WHERE task_id = ?")
                .bind(&task_id)
                .fetch_optional(pool)
                .await?
                .flatten();
        if let Some(artifact_id) = active_artifact {
            if let Some(review) =
                crate::reviews::latest_review_for_artifact(pool, &artifact_id).await?
            {
                lines.push(format!(
                    "  - last_review: score={} action={} by={} at={}",
                    review.total_score,
                    review.action_required.as_str(),
                    review.reviewer_agent_id,
                    review.created_at,
                ));
                if !review.summary.is_empty() {
                    lines.push(format!(
                        "    summary: {}",
                        crate::util::truncate_str(&review.summary, 160)
                    ));
                }
            }
        }

        // Last error with its hint.
        let last_error = sqlx::query(
            "SELECT created_at, payload_json FROM task_events
             WHERE plan_id = ? AND task_id = ? AND event_type = 'ERROR'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(plan_id)
        .bind(&task_id)
        .fetch_optional(pool)
        .await?;
        if let Some(error_row) = last_error {
            let payload: serde_json::Value =
                serde_json::from_str(&error_row.get::<String, _>("payload_json")).unwrap_or_default();
            lines.push(format!(
                "  - last_error_at: {}",
                error_row.get::<String, _>("created_at")
            ));
            if let Some(code) = payload.get("error_code").and_then(|v| v.as_str()) {
                lines.push(format!("  - last_error_code: {}", code));
            }
            if let Some(hint) = payload.get("hint").and_then(|v| v.as_str()) {
                lines.push(format!("  - hint: {}", hint));
            }
        }
    }
    lines.push(String::new());

    let path = ctx.workspace.required_docs_dir().join("blocked_summary.md");
    tokio::fs::create_dir_all(ctx.workspace.required_docs_dir()).await?;
    tokio::fs::write(&path, lines.join("\n")).await?;
    Ok(path)
}
