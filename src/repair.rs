//! Mutating maintenance commands: repair-db, reset-failed, reset-db.
//!
//! The doctor diagnoses; these repair. Each fix is journalled.

use serde_json::json;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::events::{emit_event, set_status, EVENT_DECOMPOSE_BACKFILL};
use crate::model::TaskStatus;
use crate::util::{new_uuid, utc_now_iso};

#[derive(Debug, Default)]
pub struct RepairReport {
    pub root_stubs_created: u64,
    pub decompose_edges_added: u64,
    pub orphan_edges_removed: u64,
}

/// Fix the structural problems the doctor reports: missing root stubs,
/// plans whose root cannot aggregate, and dangling edges.
pub async fn repair_db(pool: &SqlitePool) -> anyhow::Result<RepairReport> {
    let mut report = RepairReport::default();

    // Root stubs for plans whose root_task_id has no node.
    let missing_roots = sqlx::query(
        "SELECT p.plan_id, p.title, p.owner_agent_id, p.root_task_id
         FROM plans p LEFT JOIN task_nodes n ON n.task_id = p.root_task_id
         WHERE n.task_id IS NULL",
    )
    .fetch_all(pool)
    .await?;
    for plan in missing_roots {
        let plan_id: String = plan.get("plan_id");
        let root_task_id: String = plan.get("root_task_id");
        let now = utc_now_iso();
        sqlx::query(
            "INSERT INTO task_nodes(
                task_id, plan_id, node_type, title, owner_agent_id, tags_json,
                priority, status, attempt_count, active_branch, created_at, updated_at
            ) VALUES(?, ?, 'GOAL', ?, ?, '[\"placeholder\",\"autofix\"]', 0, 'PENDING', 0, 1, ?, ?)",
        )
        .bind(&root_task_id)
        .bind(&plan_id)
        .bind(plan.get::<String, _>("title"))
        .bind(plan.get::<String, _>("owner_agent_id"))
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;
        report.root_stubs_created += 1;
        info!(plan_id = %plan_id, "repair: created missing root stub");
    }

    // Orphan edges (either endpoint gone) are dropped.
    let orphan_edges = sqlx::query(
        "SELECT e.edge_id
         FROM task_edges e
         LEFT JOIN task_nodes a ON a.task_id = e.from_task_id
         LEFT JOIN task_nodes b ON b.task_id = e.to_task_id
         WHERE a.task_id IS NULL OR b.task_id IS NULL",
    )
    .fetch_all(pool)
    .await?;
    for edge in orphan_edges {
        let edge_id: String = edge.get("edge_id");
        sqlx::query("DELETE FROM task_edges WHERE edge_id = ?")
            .bind(&edge_id)
            .execute(pool)
            .await?;
        report.orphan_edges_removed += 1;
    }

    // Plans whose root has no DECOMPOSE children but other nodes exist:
    // backfill root-to-node edges so aggregation can complete.
    let plans = sqlx::query("SELECT plan_id, root_task_id FROM plans")
        .fetch_all(pool)
        .await?;
    for plan in plans {
        let plan_id: String = plan.get("plan_id");
        let root_task_id: String = plan.get("root_task_id");

        let node_count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM task_nodes WHERE plan_id = ?")
                .bind(&plan_id)
                .fetch_one(pool)
                .await?;
        let decompose_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM task_edges WHERE plan_id = ? AND edge_type = 'DECOMPOSE'",
        )
        .bind(&plan_id)
        .fetch_one(pool)
        .await?;
        if node_count <= 1 || decompose_count > 0 {
            continue;
        }

        let children = sqlx::query("SELECT task_id FROM task_nodes WHERE plan_id = ? AND task_id != ?")
            .bind(&plan_id)
            .bind(&root_task_id)
            .fetch_all(pool)
            .await?;
        for child in children {
            let child_id: String = child.get("task_id");
            sqlx::query(
                "INSERT INTO task_edges(edge_id, plan_id, from_task_id, to_task_id, edge_type, metadata_json, created_at)
                 VALUES(?, ?, ?, ?, 'DECOMPOSE', '{\"and_or\":\"AND\"}', ?)",
            )
            .bind(new_uuid())
            .bind(&plan_id)
            .bind(&root_task_id)
            .bind(&child_id)
            .bind(utc_now_iso())
            .execute(pool)
            .await?;
            report.decompose_edges_added += 1;
        }
        emit_event(
            pool,
            &plan_id,
            None,
            EVENT_DECOMPOSE_BACKFILL,
            json!({"edges_added": report.decompose_edges_added}),
        )
        .await?;
    }

    Ok(report)
}

/// Reset FAILED and attempt-capped BLOCKED tasks back to PENDING with a
/// fresh attempt counter; the next sweep re-evaluates readiness.
pub async fn reset_failed(pool: &SqlitePool, plan_id: &str) -> anyhow::Result<u64> {
    let rows = sqlx::query(
        "SELECT task_id FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1
           AND (status = 'FAILED'
                OR (status = 'BLOCKED' AND blocked_reason = 'WAITING_EXTERNAL'))",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let count = rows.len() as u64;
    for row in rows {
        let task_id: String = row.get("task_id");
        sqlx::query("UPDATE task_nodes SET attempt_count = 0, updated_at = ? WHERE task_id = ?")
            .bind(utc_now_iso())
            .bind(&task_id)
            .execute(pool)
            .await?;
        set_status(pool, plan_id, &task_id, TaskStatus::Pending, None).await?;
    }
    sqlx::query("DELETE FROM task_error_counters WHERE plan_id = ?")
        .bind(plan_id)
        .execute(pool)
        .await?;
    Ok(count)
}

/// Drop all engine tables' contents. The schema stays; the data is gone.
pub async fn reset_db(pool: &SqlitePool) -> anyhow::Result<()> {
    // Children before parents so foreign keys hold throughout.
    for table in [
        "task_events",
        "evidences",
        "reviews",
        "artifacts",
        "skill_runs",
        "input_requirements",
        "task_edges",
        "task_error_counters",
        "input_files",
        "llm_calls",
        "task_nodes",
        "plans",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table)).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_repair_creates_root_stub_and_backfills_edges() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at)
             VALUES('p1', 'Broken', 'xiaobo', 'root-1', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO task_nodes(task_id, plan_id, node_type, title, owner_agent_id, created_at, updated_at)
             VALUES('child-1', 'p1', 'ACTION', 'Orphan child', 'xiaobo', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let report = repair_db(store.pool()).await.unwrap();
        assert_eq!(report.root_stubs_created, 1);
        assert_eq!(report.decompose_edges_added, 1);

        // Doctor is clean afterwards.
        let findings = crate::doctor::doctor_db(store.pool()).await.unwrap();
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[tokio::test]
    async fn test_reset_failed_clears_attempts_and_unblocks() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at)
             VALUES('p1', 'T', 'xiaobo', 't1', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO task_nodes(task_id, plan_id, node_type, title, owner_agent_id,
                                    status, blocked_reason, attempt_count, created_at, updated_at)
             VALUES('t1', 'p1', 'ACTION', 'Stuck', 'xiaobo', 'BLOCKED', 'WAITING_EXTERNAL', 3,
                    '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let count = reset_failed(store.pool(), "p1").await.unwrap();
        assert_eq!(count, 1);

        let (status, attempts): (String, i64) =
            sqlx::query_as("SELECT status, attempt_count FROM task_nodes WHERE task_id = 't1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(status, "PENDING");
        assert_eq!(attempts, 0);
    }

    #[tokio::test]
    async fn test_reset_db_empties_everything() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at)
             VALUES('p1', 'T', 'xiaobo', 't1', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        reset_db(store.pool()).await.unwrap();
        let plans: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM plans")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(plans, 0);
    }
}
