//! Scheduler: deterministic task picking.
//!
//! At most one executor task per tick, drawn from READY ∪ TO_BE_MODIFY on
//! the active branch with a fixed total order:
//!   1. TO_BE_MODIFY before READY
//!   2. higher priority
//!   3. fewer attempts
//!   4. earlier created_at (then task_id, so the order is total)
//! Given the same store snapshot the same task comes back.

use sqlx::SqlitePool;

use crate::model::{TaskNode, AGENT_EXECUTOR};
use crate::store::{row_to_task_node, TASK_NODE_COLUMNS};

pub async fn pick_next_action(
    pool: &SqlitePool,
    plan_id: &str,
) -> anyhow::Result<Option<TaskNode>> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_NODE_COLUMNS}
         FROM task_nodes
         WHERE plan_id = ?
           AND active_branch = 1
           AND owner_agent_id = ?
           AND node_type = 'ACTION'
           AND status IN ('TO_BE_MODIFY', 'READY')
         ORDER BY
           CASE status WHEN 'TO_BE_MODIFY' THEN 0 ELSE 1 END,
           priority DESC,
           attempt_count ASC,
           created_at ASC,
           task_id ASC
         LIMIT 1",
    ))
    .bind(plan_id)
    .bind(AGENT_EXECUTOR)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_task_node).transpose()
}

/// Tasks holding an unreviewed candidate artifact, highest priority first.
pub async fn pick_review_tasks(
    pool: &SqlitePool,
    plan_id: &str,
    limit: i64,
) -> anyhow::Result<Vec<TaskNode>> {
    let rows = sqlx::query(&format!(
        "SELECT {TASK_NODE_COLUMNS}
         FROM task_nodes
         WHERE plan_id = ?
           AND active_branch = 1
           AND node_type = 'ACTION'
           AND status = 'READY_TO_CHECK'
         ORDER BY priority DESC, attempt_count ASC, created_at ASC, task_id ASC
         LIMIT ?",
    ))
    .bind(plan_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_task_node).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::util::utc_now_iso;

    async fn seed(store: &Store) {
        sqlx::query(
            "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at)
             VALUES('p1', 'T', 'xiaobo', 'root', ?)",
        )
        .bind(utc_now_iso())
        .execute(store.pool())
        .await
        .unwrap();
    }

    async fn add_task(
        store: &Store,
        task_id: &str,
        status: &str,
        priority: i64,
        attempts: i64,
        created_at: &str,
    ) {
        sqlx::query(
            "INSERT INTO task_nodes(task_id, plan_id, node_type, title, owner_agent_id,
                                    priority, status, attempt_count, active_branch, created_at, updated_at)
             VALUES(?, 'p1', 'ACTION', ?, 'xiaobo', ?, ?, ?, 1, ?, ?)",
        )
        .bind(task_id)
        .bind(task_id)
        .bind(priority)
        .bind(status)
        .bind(attempts)
        .bind(created_at)
        .bind(created_at)
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_to_be_modify_wins_over_ready() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        add_task(&store, "ready-high", "READY", 100, 0, "2025-01-01T00:00:00Z").await;
        add_task(&store, "modify-low", "TO_BE_MODIFY", 1, 2, "2025-01-02T00:00:00Z").await;

        let picked = pick_next_action(store.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(picked.task_id, "modify-low");
    }

    #[tokio::test]
    async fn test_priority_then_attempts_then_age() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        add_task(&store, "low-prio", "READY", 1, 0, "2025-01-01T00:00:00Z").await;
        add_task(&store, "high-many-attempts", "READY", 5, 3, "2025-01-01T00:00:00Z").await;
        add_task(&store, "high-fresh", "READY", 5, 0, "2025-01-02T00:00:00Z").await;
        add_task(&store, "high-fresh-older", "READY", 5, 0, "2025-01-01T00:00:00Z").await;

        let picked = pick_next_action(store.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(picked.task_id, "high-fresh-older");
    }

    #[tokio::test]
    async fn test_deterministic_given_same_snapshot() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        for i in 0..5 {
            add_task(&store, &format!("t{}", i), "READY", 3, 0, "2025-01-01T00:00:00Z").await;
        }
        let first = pick_next_action(store.pool(), "p1").await.unwrap().unwrap();
        for _ in 0..5 {
            let again = pick_next_action(store.pool(), "p1").await.unwrap().unwrap();
            assert_eq!(again.task_id, first.task_id);
        }
    }

    #[tokio::test]
    async fn test_inactive_branch_and_blocked_excluded() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        add_task(&store, "blocked", "BLOCKED", 9, 0, "2025-01-01T00:00:00Z").await;
        sqlx::query(
            "INSERT INTO task_nodes(task_id, plan_id, node_type, title, owner_agent_id,
                                    priority, status, attempt_count, active_branch, created_at, updated_at)
             VALUES('inactive', 'p1', 'ACTION', 'x', 'xiaobo', 9, 'READY', 0, 0, '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        assert!(pick_next_action(store.pool(), "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_review_picks_only_ready_to_check() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        add_task(&store, "candidate", "READY_TO_CHECK", 5, 0, "2025-01-01T00:00:00Z").await;
        add_task(&store, "running", "READY", 9, 0, "2025-01-01T00:00:00Z").await;

        let reviews = pick_review_tasks(store.pool(), "p1", 10).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].task_id, "candidate");
    }
}
