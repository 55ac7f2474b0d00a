//! Store - durable state on SQLite.
//!
//! The engine loop is the single writer; the CLI reads concurrently through
//! WAL snapshots. All timestamps are RFC3339 TEXT.

pub mod migrations;

use std::path::Path;

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::model::{BlockedReason, NodeType, Plan, TaskNode, TaskStatus};
use crate::util::utc_now_iso;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path`, enable foreign keys and WAL,
    /// and apply any missing migrations.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        migrations::apply_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. One connection so all statements share the db.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        migrations::apply_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Plans
    // =========================================================================

    pub async fn get_plan(&self, plan_id: &str) -> anyhow::Result<Option<Plan>> {
        let row = sqlx::query(
            "SELECT plan_id, title, owner_agent_id, root_task_id, created_at, constraints_json
             FROM plans WHERE plan_id = ?",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_plan).transpose()?)
    }

    /// The most recently created plan; used by CLI commands that omit --plan-id.
    pub async fn latest_plan_id(&self) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT plan_id FROM plans ORDER BY created_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("plan_id")))
    }

    pub async fn is_plan_done(&self, plan_id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT n.status
             FROM plans p
             JOIN task_nodes n ON n.task_id = p.root_task_id
             WHERE p.plan_id = ?",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| r.get::<String, _>("status") == "DONE")
            .unwrap_or(false))
    }

    // =========================================================================
    // Task nodes
    // =========================================================================

    pub async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<TaskNode>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_nodes WHERE task_id = ?",
            TASK_NODE_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_task_node).transpose()?)
    }

    pub async fn tasks_for_plan(&self, plan_id: &str) -> anyhow::Result<Vec<TaskNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_nodes WHERE plan_id = ? ORDER BY created_at ASC, task_id ASC",
            TASK_NODE_COLUMNS
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task_node).collect()
    }

    pub async fn increment_attempt(&self, task_id: &str) -> anyhow::Result<i64> {
        sqlx::query(
            "UPDATE task_nodes SET attempt_count = attempt_count + 1, updated_at = ? WHERE task_id = ?",
        )
        .bind(utc_now_iso())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        self.attempt_count(task_id).await
    }

    pub async fn attempt_count(&self, task_id: &str) -> anyhow::Result<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT attempt_count FROM task_nodes WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn set_approved_artifact(
        &self,
        task_id: &str,
        artifact_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE task_nodes SET approved_artifact_id = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(artifact_id)
        .bind(utc_now_iso())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Error counters (skill retry budgets)
    // =========================================================================

    pub async fn increment_counter(
        &self,
        plan_id: &str,
        task_id: &str,
        key: &str,
    ) -> anyhow::Result<i64> {
        sqlx::query(
            "INSERT INTO task_error_counters(plan_id, task_id, key, count, updated_at)
             VALUES(?, ?, ?, 1, ?)
             ON CONFLICT(plan_id, task_id, key) DO UPDATE SET
               count = count + 1,
               updated_at = excluded.updated_at",
        )
        .bind(plan_id)
        .bind(task_id)
        .bind(key)
        .bind(utc_now_iso())
        .execute(&self.pool)
        .await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT count FROM task_error_counters WHERE plan_id = ? AND task_id = ? AND key = ?",
        )
        .bind(plan_id)
        .bind(task_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn reset_counter(
        &self,
        plan_id: &str,
        task_id: &str,
        key: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM task_error_counters WHERE plan_id = ? AND task_id = ? AND key = ?",
        )
        .bind(plan_id)
        .bind(task_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub const TASK_NODE_COLUMNS: &str = "task_id, plan_id, node_type, title, goal_statement, owner_agent_id, tags_json, \
     priority, status, blocked_reason, attempt_count, active_branch, \
     active_artifact_id, approved_artifact_id, estimated_person_days, \
     deliverable_spec_json, acceptance_criteria_json, review_target_task_id, created_at";

pub fn row_to_task_node(row: SqliteRow) -> anyhow::Result<TaskNode> {
    let node_type_str: String = row.get("node_type");
    let status_str: String = row.get("status");
    let blocked_str: Option<String> = row.get("blocked_reason");
    let tags_json: String = row.get("tags_json");
    let created_str: String = row.get("created_at");

    let node_type = NodeType::from_str(&node_type_str)
        .ok_or_else(|| anyhow::anyhow!("unknown node_type in db: {}", node_type_str))?;
    let status = TaskStatus::from_str(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown status in db: {}", status_str))?;
    let blocked_reason = blocked_str.as_deref().and_then(BlockedReason::from_str);
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());

    let deliverable_spec: Option<JsonValue> = row
        .try_get::<Option<String>, _>("deliverable_spec_json")
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());
    let acceptance_criteria: Option<JsonValue> = row
        .try_get::<Option<String>, _>("acceptance_criteria_json")
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(TaskNode {
        task_id: row.get("task_id"),
        plan_id: row.get("plan_id"),
        node_type,
        title: row.get("title"),
        goal_statement: row.get("goal_statement"),
        owner_agent_id: row.get("owner_agent_id"),
        priority: row.get("priority"),
        status,
        blocked_reason,
        attempt_count: row.get("attempt_count"),
        active_branch: row.get::<i64, _>("active_branch") != 0,
        active_artifact_id: row.get("active_artifact_id"),
        approved_artifact_id: row.get("approved_artifact_id"),
        tags,
        estimated_person_days: row.try_get("estimated_person_days").unwrap_or(None),
        deliverable_spec,
        acceptance_criteria,
        review_target_task_id: row.try_get("review_target_task_id").unwrap_or(None),
        created_at,
    })
}

fn row_to_plan(row: SqliteRow) -> anyhow::Result<Plan> {
    let constraints_json: String = row.get("constraints_json");
    Ok(Plan {
        plan_id: row.get("plan_id"),
        title: row.get("title"),
        owner_agent_id: row.get("owner_agent_id"),
        root_task_id: row.get("root_task_id"),
        created_at: row.get("created_at"),
        constraints: serde_json::from_str(&constraints_json).unwrap_or(JsonValue::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_applies_migrations() {
        let store = Store::open_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM schema_migrations")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(count > 0);
    }

    #[tokio::test]
    async fn test_counters_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(
            store.increment_counter("p", "t", "WAITING_SKILL").await.unwrap(),
            1
        );
        assert_eq!(
            store.increment_counter("p", "t", "WAITING_SKILL").await.unwrap(),
            2
        );
        store.reset_counter("p", "t", "WAITING_SKILL").await.unwrap();
        assert_eq!(
            store.increment_counter("p", "t", "WAITING_SKILL").await.unwrap(),
            1
        );
    }
}
