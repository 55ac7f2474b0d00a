//! Plan import: validate a `plan_json_v1` document and upsert all four
//! entity tables within a single transaction.
//!
//! Plans, nodes, edges, and requirements are created atomically here and are
//! structurally immutable afterwards; only status fields, counters, and
//! artifact pointers change during execution.

use std::path::Path;

use serde_json::Value;
use sqlx::SqlitePool;

use crate::contracts::validate_plan_json;
use crate::errors::ErrorCode;
use crate::util::{canonical_json, utc_now_iso};

#[derive(Debug)]
pub struct PlanInvalidError {
    pub reason: String,
}

impl std::fmt::Display for PlanInvalidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", ErrorCode::PlanInvalid.as_str(), self.reason)
    }
}

impl std::error::Error for PlanInvalidError {}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Upsert a validated plan document. The caller is responsible for having
/// run `normalize_and_validate(Scope::PlanGen, ...)` first; this function
/// re-validates as a belt against direct disk loads.
pub async fn upsert_plan(pool: &SqlitePool, plan_json: &Value) -> anyhow::Result<String> {
    validate_plan_json(plan_json).map_err(|reason| PlanInvalidError { reason })?;

    let plan = &plan_json["plan"];
    let plan_id = str_field(plan, "plan_id").to_string();
    let now = utc_now_iso();

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at, constraints_json)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(plan_id) DO UPDATE SET
           title = excluded.title,
           owner_agent_id = excluded.owner_agent_id,
           root_task_id = excluded.root_task_id,
           constraints_json = excluded.constraints_json",
    )
    .bind(&plan_id)
    .bind(str_field(plan, "title"))
    .bind(str_field(plan, "owner_agent_id"))
    .bind(str_field(plan, "root_task_id"))
    .bind(str_field(plan, "created_at"))
    .bind(canonical_json(plan.get("constraints").unwrap_or(&Value::Null)))
    .execute(&mut *tx)
    .await?;

    for node in plan_json["nodes"].as_array().into_iter().flatten() {
        let tags = node.get("tags").cloned().unwrap_or_else(|| Value::Array(vec![]));
        let deliverable = node
            .get("deliverable_spec")
            .or_else(|| node.get("deliverable_spec_json"))
            .filter(|v| !v.is_null())
            .map(canonical_json);
        let acceptance = node
            .get("acceptance_criteria")
            .or_else(|| node.get("acceptance_criteria_json"))
            .filter(|v| !v.is_null())
            .map(canonical_json);
        let review_target = node
            .get("review_target_task_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let estimated = node.get("estimated_person_days").and_then(Value::as_f64);

        sqlx::query(
            "INSERT INTO task_nodes(
                task_id, plan_id, node_type, title, goal_statement, owner_agent_id,
                tags_json, priority, status, blocked_reason, attempt_count, active_branch,
                active_artifact_id, approved_artifact_id, created_at, updated_at,
                estimated_person_days, deliverable_spec_json, acceptance_criteria_json,
                review_target_task_id
            )
            VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', NULL, 0, 1, NULL, NULL, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
              plan_id = excluded.plan_id,
              node_type = excluded.node_type,
              title = excluded.title,
              goal_statement = excluded.goal_statement,
              owner_agent_id = excluded.owner_agent_id,
              tags_json = excluded.tags_json,
              priority = excluded.priority,
              estimated_person_days = COALESCE(excluded.estimated_person_days, task_nodes.estimated_person_days),
              deliverable_spec_json = COALESCE(excluded.deliverable_spec_json, task_nodes.deliverable_spec_json),
              acceptance_criteria_json = COALESCE(excluded.acceptance_criteria_json, task_nodes.acceptance_criteria_json),
              review_target_task_id = COALESCE(excluded.review_target_task_id, task_nodes.review_target_task_id),
              updated_at = excluded.updated_at",
        )
        .bind(str_field(node, "task_id"))
        .bind(&plan_id)
        .bind(str_field(node, "node_type"))
        .bind(str_field(node, "title"))
        .bind(node.get("goal_statement").and_then(Value::as_str))
        .bind(str_field(node, "owner_agent_id"))
        .bind(canonical_json(&tags))
        .bind(node.get("priority").and_then(Value::as_i64).unwrap_or(0))
        .bind(&now)
        .bind(&now)
        .bind(estimated)
        .bind(deliverable)
        .bind(acceptance)
        .bind(review_target)
        .execute(&mut *tx)
        .await?;
    }

    for edge in plan_json["edges"].as_array().into_iter().flatten() {
        let metadata = edge.get("metadata").cloned().unwrap_or_else(|| Value::Object(Default::default()));
        sqlx::query(
            "INSERT INTO task_edges(edge_id, plan_id, from_task_id, to_task_id, edge_type, metadata_json, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(edge_id) DO UPDATE SET
               plan_id = excluded.plan_id,
               from_task_id = excluded.from_task_id,
               to_task_id = excluded.to_task_id,
               edge_type = excluded.edge_type,
               metadata_json = excluded.metadata_json",
        )
        .bind(str_field(edge, "edge_id"))
        .bind(&plan_id)
        .bind(str_field(edge, "from_task_id"))
        .bind(str_field(edge, "to_task_id"))
        .bind(str_field(edge, "edge_type"))
        .bind(canonical_json(&metadata))
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    for req in plan_json["requirements"].as_array().into_iter().flatten() {
        let allowed_types: Vec<String> = req
            .get("allowed_types")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let validation = req
            .get("validation")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        sqlx::query(
            "INSERT INTO input_requirements(
                requirement_id, task_id, name, kind, required, min_count,
                allowed_types_json, source, validation_json, created_at
            )
            VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(requirement_id) DO UPDATE SET
              task_id = excluded.task_id,
              name = excluded.name,
              kind = excluded.kind,
              required = excluded.required,
              min_count = excluded.min_count,
              allowed_types_json = excluded.allowed_types_json,
              source = excluded.source,
              validation_json = excluded.validation_json",
        )
        .bind(str_field(req, "requirement_id"))
        .bind(str_field(req, "task_id"))
        .bind(str_field(req, "name"))
        .bind(str_field(req, "kind"))
        .bind(req.get("required").and_then(Value::as_i64).unwrap_or(1))
        .bind(req.get("min_count").and_then(Value::as_i64).unwrap_or(1).max(1))
        .bind(serde_json::to_string(&allowed_types)?)
        .bind(str_field(req, "source"))
        .bind(canonical_json(&validation))
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(plan_id)
}

/// Load `tasks/plan.json` from disk and upsert it if present.
pub async fn load_plan_into_db(pool: &SqlitePool, plan_path: &Path) -> anyhow::Result<String> {
    let content = tokio::fs::read_to_string(plan_path).await?;
    let plan_json: Value = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("invalid JSON in {}: {}", plan_path.display(), e))?;
    upsert_plan(pool, &plan_json).await
}

/// Minimal plans + root-node stub so event/telemetry foreign keys hold even
/// before a generated plan passes validation.
pub async fn ensure_plan_stub(
    pool: &SqlitePool,
    plan_id: &str,
    title: &str,
    owner_agent_id: &str,
    root_task_id: &str,
    constraints: &Value,
) -> anyhow::Result<()> {
    let exists: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM plans WHERE plan_id = ?")
        .bind(plan_id)
        .fetch_one(pool)
        .await?;
    if exists > 0 {
        return Ok(());
    }
    let now = utc_now_iso();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at, constraints_json)
         VALUES(?, ?, ?, ?, ?, ?)",
    )
    .bind(plan_id)
    .bind(title)
    .bind(owner_agent_id)
    .bind(root_task_id)
    .bind(&now)
    .bind(canonical_json(constraints))
    .execute(&mut *tx)
    .await?;

    let root_exists: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM task_nodes WHERE task_id = ?")
        .bind(root_task_id)
        .fetch_one(&mut *tx)
        .await?;
    if root_exists == 0 {
        sqlx::query(
            "INSERT INTO task_nodes(
                task_id, plan_id, node_type, title, owner_agent_id, tags_json,
                priority, status, attempt_count, active_branch, created_at, updated_at
            )
            VALUES(?, ?, 'GOAL', ?, ?, '[\"placeholder\",\"autofix\"]', 0, 'PENDING', 0, 1, ?, ?)",
        )
        .bind(root_task_id)
        .bind(plan_id)
        .bind(if title.is_empty() { "Root Task" } else { title })
        .bind(owner_agent_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{normalize_and_validate, ContractContext, Scope};
    use crate::store::Store;
    use serde_json::json;

    async fn import_minimal(store: &Store) -> String {
        let raw = json!({
            "plan": {"title": "Ship the widget"},
            "nodes": [
                {"id": "build", "type": "ACTION", "title": "Build the widget", "priority": 5},
            ],
            "requirements": [
                {"task_id": "build", "name": "product_spec", "kind": "FILE",
                 "min_count": 1, "allowed_types": ["md"], "source": "USER"},
            ],
        });
        let ctx = ContractContext {
            top_task: "Ship the widget".to_string(),
            ..Default::default()
        };
        let (normalized, err) = normalize_and_validate(Scope::PlanGen, &raw, &ctx);
        assert!(err.is_none(), "{:?}", err);
        upsert_plan(store.pool(), &normalized).await.unwrap()
    }

    #[tokio::test]
    async fn test_import_creates_all_entities() {
        let store = Store::open_in_memory().await.unwrap();
        let plan_id = import_minimal(&store).await;

        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM task_nodes WHERE plan_id = ?")
            .bind(&plan_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(nodes, 2); // synthesized root + the action

        let statuses: Vec<String> =
            sqlx::query_scalar("SELECT status FROM task_nodes WHERE plan_id = ?")
                .bind(&plan_id)
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert!(statuses.iter().all(|s| s == "PENDING"));

        let reqs: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM input_requirements")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(reqs, 1);

        let edges: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM task_edges WHERE edge_type = 'DECOMPOSE'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(edges, 1);
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let raw = json!({
            "plan": {"title": "Twice"},
            "nodes": [{"id": "a", "type": "ACTION", "title": "Once"}],
        });
        let ctx = ContractContext::default();
        let (normalized, err) = normalize_and_validate(Scope::PlanGen, &raw, &ctx);
        assert!(err.is_none());
        let first = upsert_plan(store.pool(), &normalized).await.unwrap();
        let second = upsert_plan(store.pool(), &normalized).await.unwrap();
        assert_eq!(first, second);

        let plans: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM plans")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(plans, 1);
    }

    #[tokio::test]
    async fn test_invalid_plan_rejected_without_partial_commit() {
        let store = Store::open_in_memory().await.unwrap();
        let invalid = json!({"plan": {}, "nodes": [], "edges": [], "requirements": []});
        let result = upsert_plan(store.pool(), &invalid).await;
        assert!(result.is_err());

        let plans: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM plans")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(plans, 0);
    }

    #[tokio::test]
    async fn test_plan_stub_satisfies_event_fk() {
        let store = Store::open_in_memory().await.unwrap();
        ensure_plan_stub(
            store.pool(),
            "22222222-2222-4222-8222-222222222222",
            "Stub",
            "xiaobo",
            "33333333-3333-4333-8333-333333333333",
            &json!({}),
        )
        .await
        .unwrap();

        crate::events::emit_event(
            store.pool(),
            "22222222-2222-4222-8222-222222222222",
            None,
            crate::events::EVENT_ERROR,
            json!({"error_code": "PLAN_INVALID"}),
        )
        .await
        .unwrap();
    }
}
