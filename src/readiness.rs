//! Readiness: one recompute sweep per tick.
//!
//! For each active task: prerequisites are every DEPENDS_ON predecessor in
//! DONE, inputs are satisfied when every required requirement has at least
//! `min_count` evidence rows. Satisfied tasks become READY; unsatisfied
//! tasks become BLOCKED with a derived reason. GOAL nodes aggregate from
//! their DECOMPOSE children (AND/OR). Every actual status write is
//! journalled as STATUS_CHANGED.

use std::collections::HashMap;

use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::events::{emit_event, set_status, EVENT_BRANCH_CHANGED, EVENT_WAITING_INPUT};
use crate::model::{BlockedReason, TaskStatus};
use crate::util::utc_now_iso;

#[derive(Debug, Clone)]
struct MissingRequirement {
    requirement_id: String,
    name: String,
    kind: String,
    min_count: i64,
    have_count: i64,
}

async fn missing_requirements(
    pool: &SqlitePool,
    task_id: &str,
) -> anyhow::Result<Vec<MissingRequirement>> {
    let rows = sqlx::query(
        "SELECT requirement_id, name, kind, required, min_count
         FROM input_requirements WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    let mut missing = Vec::new();
    for row in rows {
        if row.get::<i64, _>("required") == 0 {
            continue;
        }
        let requirement_id: String = row.get("requirement_id");
        let min_count: i64 = row.get("min_count");
        let have_count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM evidences WHERE requirement_id = ?")
                .bind(&requirement_id)
                .fetch_one(pool)
                .await?;
        if have_count < min_count {
            missing.push(MissingRequirement {
                requirement_id,
                name: row.get("name"),
                kind: row.get("kind"),
                min_count,
                have_count,
            });
        }
    }
    Ok(missing)
}

async fn deps_satisfied(pool: &SqlitePool, plan_id: &str, task_id: &str) -> anyhow::Result<bool> {
    let unmet: i64 = sqlx::query_scalar(
        "SELECT COUNT(1)
         FROM task_edges e
         JOIN task_nodes n ON n.task_id = e.from_task_id
         WHERE e.plan_id = ? AND e.to_task_id = ? AND e.edge_type = 'DEPENDS_ON'
           AND n.status != 'DONE'",
    )
    .bind(plan_id)
    .bind(task_id)
    .fetch_one(pool)
    .await?;
    Ok(unmet == 0)
}

async fn set_active_branch(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: &str,
    active: bool,
    reason: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE task_nodes SET active_branch = ?, updated_at = ? WHERE task_id = ?")
        .bind(if active { 1 } else { 0 })
        .bind(utc_now_iso())
        .bind(task_id)
        .execute(pool)
        .await?;
    emit_event(
        pool,
        plan_id,
        Some(task_id),
        EVENT_BRANCH_CHANGED,
        json!({"active_branch": active, "reason": reason}),
    )
    .await?;
    Ok(())
}

/// ALTERNATIVE groups: once one child is DONE it wins the group and the
/// losers are abandoned; otherwise exactly one viable candidate stays on the
/// active branch (priority desc, attempts asc).
async fn apply_alternative_selection(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<()> {
    let rows = sqlx::query(
        "SELECT from_task_id, to_task_id, metadata_json
         FROM task_edges WHERE plan_id = ? AND edge_type = 'ALTERNATIVE'",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let mut groups: HashMap<(String, String), Vec<String>> = HashMap::new();
    for row in rows {
        let metadata: serde_json::Value =
            serde_json::from_str(&row.get::<String, _>("metadata_json")).unwrap_or_default();
        let Some(group_id) = metadata.get("group_id").and_then(|v| v.as_str()) else { continue };
        if group_id.is_empty() {
            continue;
        }
        groups
            .entry((row.get("from_task_id"), group_id.to_string()))
            .or_default()
            .push(row.get("to_task_id"));
    }

    for ((_, group_id), child_ids) in groups {
        let mut children = Vec::new();
        for child_id in &child_ids {
            let row = sqlx::query(
                "SELECT task_id, status, blocked_reason, priority, attempt_count, active_branch
                 FROM task_nodes WHERE task_id = ?",
            )
            .bind(child_id)
            .fetch_optional(pool)
            .await?;
            if let Some(row) = row {
                children.push((
                    row.get::<String, _>("task_id"),
                    row.get::<String, _>("status"),
                    row.get::<Option<String>, _>("blocked_reason"),
                    row.get::<i64, _>("priority"),
                    row.get::<i64, _>("attempt_count"),
                    row.get::<i64, _>("active_branch") != 0,
                ));
            }
        }

        if let Some(winner) = children.iter().find(|c| c.1 == "DONE").map(|c| c.0.clone()) {
            for (task_id, status, _, _, _, active) in &children {
                if *task_id == winner {
                    if !active {
                        set_active_branch(pool, plan_id, task_id, true, &format!("alternative_winner:{}", group_id)).await?;
                    }
                    continue;
                }
                if *active {
                    set_active_branch(pool, plan_id, task_id, false, &format!("alternative_loser:{}", group_id)).await?;
                }
                if status != "DONE" && status != "ABANDONED" {
                    set_status(pool, plan_id, task_id, TaskStatus::Abandoned, None).await?;
                }
            }
            continue;
        }

        // No winner yet: keep the current active child if still viable.
        let actives: Vec<&(String, String, Option<String>, i64, i64, bool)> = children
            .iter()
            .filter(|c| c.5 && c.1 != "ABANDONED")
            .collect();
        let mut keep = if actives.len() == 1 {
            let c = actives[0];
            let dead_end = c.1 == "FAILED"
                || (c.1 == "BLOCKED" && c.2.as_deref() == Some("WAITING_EXTERNAL"));
            if dead_end {
                None
            } else {
                Some(c.0.clone())
            }
        } else {
            None
        };

        if keep.is_none() {
            let mut candidates: Vec<&(String, String, Option<String>, i64, i64, bool)> = children
                .iter()
                .filter(|c| c.1 != "ABANDONED")
                .collect();
            candidates.sort_by(|a, b| b.3.cmp(&a.3).then(a.4.cmp(&b.4)).then(a.0.cmp(&b.0)));
            keep = candidates.first().map(|c| c.0.clone());
        }
        let Some(chosen) = keep else { continue };

        for (task_id, _, _, _, _, active) in &children {
            let target = *task_id == chosen;
            if *active != target {
                set_active_branch(pool, plan_id, task_id, target, &format!("alternative_select:{}", group_id)).await?;
            }
        }
    }
    Ok(())
}

/// An inactive parent deactivates its DECOMPOSE children; an inactive
/// prerequisite deactivates its DEPENDS_ON dependents.
async fn propagate_inactive(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<()> {
    loop {
        let rows = sqlx::query(
            "SELECT e.edge_type, e.to_task_id
             FROM task_edges e
             JOIN task_nodes n_from ON n_from.task_id = e.from_task_id
             JOIN task_nodes n_to ON n_to.task_id = e.to_task_id
             WHERE e.plan_id = ? AND e.edge_type IN ('DECOMPOSE', 'DEPENDS_ON')
               AND n_from.active_branch = 0 AND n_to.active_branch = 1",
        )
        .bind(plan_id)
        .fetch_all(pool)
        .await?;
        if rows.is_empty() {
            return Ok(());
        }
        for row in rows {
            let edge_type: String = row.get("edge_type");
            let to_task_id: String = row.get("to_task_id");
            set_active_branch(
                pool,
                plan_id,
                &to_task_id,
                false,
                &format!("propagate_inactive:{}", edge_type),
            )
            .await?;
        }
    }
}

/// CHECK nodes bound to an ACTION via review_target_task_id mirror the
/// review outcome: they complete when their target completes.
async fn mirror_check_nodes(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<u64> {
    let rows = sqlx::query(
        "SELECT c.task_id, c.status, t.status AS target_status
         FROM task_nodes c
         JOIN task_nodes t ON t.task_id = c.review_target_task_id
         WHERE c.plan_id = ? AND c.active_branch = 1 AND c.node_type = 'CHECK'
           AND c.review_target_task_id IS NOT NULL",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let mut changed = 0u64;
    for row in rows {
        let check_id: String = row.get("task_id");
        let status: String = row.get("status");
        let target_status: String = row.get("target_status");
        let desired = match target_status.as_str() {
            "DONE" => "DONE",
            "READY_TO_CHECK" => "READY",
            _ => "PENDING",
        };
        if status != desired {
            let desired_status = TaskStatus::from_str(desired).unwrap_or(TaskStatus::Pending);
            set_status(pool, plan_id, &check_id, desired_status, None).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Plan-review CHECK nodes (tagged review+plan) reflect whether the plan has
/// been approved; they are informational gates in the tree.
async fn mirror_plan_review_checks(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<u64> {
    let rows = sqlx::query(
        "SELECT task_id, status
         FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1 AND node_type = 'CHECK'
           AND review_target_task_id IS NULL
           AND tags_json LIKE '%\"review\"%' AND tags_json LIKE '%\"plan\"%'",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let approved: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_events WHERE plan_id = ? AND event_type = 'PLAN_APPROVED'",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await?;

    let mut changed = 0u64;
    for row in rows {
        let task_id: String = row.get("task_id");
        let status: String = row.get("status");
        let desired = if approved > 0 { TaskStatus::Done } else { TaskStatus::Ready };
        if status != desired.as_str() {
            set_status(pool, plan_id, &task_id, desired, None).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

pub async fn recompute_readiness_for_plan(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<u64> {
    apply_alternative_selection(pool, plan_id).await?;
    propagate_inactive(pool, plan_id).await?;
    let mut changed = mirror_plan_review_checks(pool, plan_id).await?;
    changed += mirror_check_nodes(pool, plan_id).await?;

    let rows = sqlx::query(
        "SELECT task_id, node_type, status, blocked_reason
         FROM task_nodes WHERE plan_id = ? AND active_branch = 1",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    for row in rows {
        let task_id: String = row.get("task_id");
        let node_type: String = row.get("node_type");
        let status: String = row.get("status");
        let blocked_reason: Option<String> = row.get("blocked_reason");

        // Terminal and in-flight states are left alone: DONE/ABANDONED are
        // settled, READY_TO_CHECK belongs to the reviewer, TO_BE_MODIFY to
        // the scheduler, IN_PROGRESS to the executor, FAILED to reset-failed.
        if matches!(
            status.as_str(),
            "DONE" | "ABANDONED" | "READY_TO_CHECK" | "TO_BE_MODIFY" | "IN_PROGRESS" | "FAILED"
        ) {
            continue;
        }
        // Mirrored CHECK nodes were handled above; GOAL nodes are driven by
        // aggregation, not by the scheduler.
        if node_type != "ACTION" {
            continue;
        }

        let deps_ok = deps_satisfied(pool, plan_id, &task_id).await?;
        let missing = missing_requirements(pool, &task_id).await?;
        let reqs_ok = missing.is_empty();

        if deps_ok && reqs_ok {
            if status != "READY" {
                set_status(pool, plan_id, &task_id, TaskStatus::Ready, None).await?;
                changed += 1;
            }
            continue;
        }

        let reason = if !reqs_ok {
            if missing.iter().all(|m| m.kind == "SKILL_OUTPUT") {
                BlockedReason::WaitingSkill
            } else {
                BlockedReason::WaitingInput
            }
        } else {
            // Inputs are fine; the task waits on upstream work that only an
            // operator can unstick if it never finishes.
            BlockedReason::WaitingExternal
        };

        let already = status == "BLOCKED" && blocked_reason.as_deref() == Some(reason.as_str());
        if !already {
            if !reqs_ok {
                emit_event(
                    pool,
                    plan_id,
                    Some(&task_id),
                    EVENT_WAITING_INPUT,
                    json!({
                        "missing_requirements": missing.iter().map(|m| json!({
                            "requirement_id": m.requirement_id,
                            "name": m.name,
                            "min_count": m.min_count,
                            "have_count": m.have_count,
                        })).collect::<Vec<_>>(),
                    }),
                )
                .await?;
            }
            set_status(pool, plan_id, &task_id, TaskStatus::Blocked, Some(reason)).await?;
            changed += 1;
        }
    }

    changed += aggregate_goals(pool, plan_id).await?;
    Ok(changed)
}

/// GOAL aggregation: AND parents complete when every active DECOMPOSE child
/// is DONE; OR parents complete on the first DONE child.
async fn aggregate_goals(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<u64> {
    let parents = sqlx::query(
        "SELECT task_id FROM task_nodes
         WHERE plan_id = ? AND node_type = 'GOAL' AND status != 'DONE' AND active_branch = 1",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let mut changed = 0u64;
    for parent in parents {
        let parent_id: String = parent.get("task_id");
        let child_rows = sqlx::query(
            "SELECT e.to_task_id, e.metadata_json, n.status, n.active_branch
             FROM task_edges e
             JOIN task_nodes n ON n.task_id = e.to_task_id
             WHERE e.plan_id = ? AND e.from_task_id = ? AND e.edge_type = 'DECOMPOSE'",
        )
        .bind(plan_id)
        .bind(&parent_id)
        .fetch_all(pool)
        .await?;
        if child_rows.is_empty() {
            continue;
        }

        let mut and_or = "AND".to_string();
        for child in &child_rows {
            let metadata: serde_json::Value =
                serde_json::from_str(&child.get::<String, _>("metadata_json")).unwrap_or_default();
            if let Some(mode) = metadata.get("and_or").and_then(|v| v.as_str()) {
                if mode == "AND" || mode == "OR" {
                    and_or = mode.to_string();
                    break;
                }
            }
        }

        let active: Vec<&sqlx::sqlite::SqliteRow> = child_rows
            .iter()
            .filter(|c| c.get::<i64, _>("active_branch") != 0)
            .collect();
        let done = active
            .iter()
            .filter(|c| c.get::<String, _>("status") == "DONE")
            .count();

        let complete = match and_or.as_str() {
            "OR" => done >= 1,
            _ => !active.is_empty() && done == active.len(),
        };
        if complete {
            set_status(pool, plan_id, &parent_id, TaskStatus::Done, None).await?;
            changed += 1;
        }
    }
    Ok(changed)
}
