//! Doctor: preflight invariants and structural self-check.
//!
//! Read-only by contract: the doctor reports findings with machine-readable
//! codes and hints, and never mutates state. `repair-db` is the mutating
//! counterpart.

use sqlx::{Row, SqlitePool};

use crate::config::RuntimeConfig;
use crate::status::validate_status_for_node_type;
use crate::store::migrations::latest_migration_name;

#[derive(Debug, Clone)]
pub struct DoctorFinding {
    pub code: &'static str,
    pub message: String,
    pub hint: String,
    pub task_id: Option<String>,
    pub task_title: Option<String>,
}

impl DoctorFinding {
    fn new(code: &'static str, message: String, hint: &str) -> Self {
        Self {
            code,
            message,
            hint: hint.to_string(),
            task_id: None,
            task_title: None,
        }
    }
}

const EXPECTED_TABLES: &[&str] = &[
    "schema_migrations",
    "plans",
    "task_nodes",
    "task_edges",
    "input_requirements",
    "evidences",
    "artifacts",
    "reviews",
    "skill_runs",
    "task_events",
    "task_error_counters",
    "input_files",
    "llm_calls",
    "prompts",
];

async fn table_exists(pool: &SqlitePool, name: &str) -> anyhow::Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

pub async fn doctor_db(pool: &SqlitePool) -> anyhow::Result<Vec<DoctorFinding>> {
    let mut findings = Vec::new();

    let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(pool).await?;
    if fk != 1 {
        findings.push(DoctorFinding::new(
            "DB_FOREIGN_KEYS_OFF",
            "PRAGMA foreign_keys is OFF (expected ON)".to_string(),
            "Open the database through Store::open; it enables the pragma on every connection.",
        ));
    }

    for table in EXPECTED_TABLES {
        if !table_exists(pool, table).await? {
            findings.push(DoctorFinding::new(
                "DB_MISSING_TABLE",
                format!("missing table: {}", table),
                "Run any engine command; migrations apply on open. If this persists, the db file is foreign.",
            ));
        }
    }

    let latest = latest_migration_name();
    if !latest.is_empty() && table_exists(pool, "schema_migrations").await? {
        let applied: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM schema_migrations WHERE filename = ?")
                .bind(latest)
                .fetch_one(pool)
                .await?;
        if applied == 0 {
            findings.push(DoctorFinding::new(
                "DB_MIGRATION_NOT_APPLIED",
                format!("latest migration not applied: {}", latest),
                "Reopen the database through Store::open to apply pending migrations.",
            ));
        }
    }

    // Referential integrity, checked directly rather than trusting FKs.
    if table_exists(pool, "task_nodes").await? && table_exists(pool, "plans").await? {
        let orphans: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM task_nodes n LEFT JOIN plans p ON p.plan_id = n.plan_id
             WHERE p.plan_id IS NULL",
        )
        .fetch_one(pool)
        .await?;
        if orphans > 0 {
            findings.push(DoctorFinding::new(
                "DB_ORPHAN_TASK_NODES",
                format!("task_nodes.plan_id not found in plans: {} row(s)", orphans),
                "Run repair-db, or reset-db to restart clean.",
            ));
        }

        let bad_roots: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM plans p LEFT JOIN task_nodes n ON n.task_id = p.root_task_id
             WHERE n.task_id IS NULL",
        )
        .fetch_one(pool)
        .await?;
        if bad_roots > 0 {
            findings.push(DoctorFinding::new(
                "DB_BAD_ROOT_TASK",
                format!("plans.root_task_id missing in task_nodes: {} plan(s)", bad_roots),
                "Run repair-db; it creates missing root stubs.",
            ));
        }
    }

    if table_exists(pool, "task_edges").await? && table_exists(pool, "task_nodes").await? {
        let orphan_edges: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM task_edges e
             LEFT JOIN task_nodes a ON a.task_id = e.from_task_id
             LEFT JOIN task_nodes b ON b.task_id = e.to_task_id
             WHERE a.task_id IS NULL OR b.task_id IS NULL",
        )
        .fetch_one(pool)
        .await?;
        if orphan_edges > 0 {
            findings.push(DoctorFinding::new(
                "DB_ORPHAN_EDGES",
                format!("task_edges endpoints missing in task_nodes: {} edge(s)", orphan_edges),
                "Run repair-db, or regenerate the plan via create-plan.",
            ));
        }
    }

    Ok(findings)
}

pub async fn doctor_plan(
    pool: &SqlitePool,
    plan_id: &str,
    config: &RuntimeConfig,
) -> anyhow::Result<Vec<DoctorFinding>> {
    let mut findings = Vec::new();
    if plan_id.trim().is_empty() {
        return Ok(vec![DoctorFinding::new(
            "PLAN_ID_MISSING",
            "plan_id is required".to_string(),
            "Pass --plan-id or run create-plan first.",
        )]);
    }

    let plan = sqlx::query("SELECT plan_id, root_task_id, title FROM plans WHERE plan_id = ?")
        .bind(plan_id)
        .fetch_optional(pool)
        .await?;
    let Some(plan) = plan else {
        return Ok(vec![DoctorFinding::new(
            "PLAN_NOT_FOUND",
            format!("plan_id not found in DB: {}", plan_id),
            "Run create-plan first, or pass the correct --plan-id.",
        )]);
    };

    let root_task_id: String = plan.get("root_task_id");
    let root = sqlx::query("SELECT task_id, node_type, title FROM task_nodes WHERE task_id = ?")
        .bind(&root_task_id)
        .fetch_optional(pool)
        .await?;
    match root {
        None => findings.push(DoctorFinding::new(
            "PLAN_ROOT_TASK_NOT_FOUND",
            format!("root_task_id not found in task_nodes: {}", root_task_id),
            "Run repair-db or recreate the plan.",
        )),
        Some(root) => {
            let node_type: String = root.get("node_type");
            if node_type != "GOAL" {
                let mut finding = DoctorFinding::new(
                    "PLAN_ROOT_NOT_GOAL",
                    format!("root task node_type must be GOAL (got {})", node_type),
                    "Regenerate the plan with a GOAL root node.",
                );
                finding.task_id = Some(root.get("task_id"));
                finding.task_title = Some(root.get("title"));
                findings.push(finding);
            }
        }
    }

    let action_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_nodes WHERE plan_id = ? AND node_type = 'ACTION'",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await?;
    if action_count == 0 {
        findings.push(DoctorFinding::new(
            "PLAN_NO_ACTIONS",
            "plan has no ACTION nodes".to_string(),
            "Regenerate via create-plan; a runnable plan needs at least one ACTION.",
        ));
    }

    // Status × node_type legality.
    let rows = sqlx::query("SELECT task_id, title, node_type, status FROM task_nodes WHERE plan_id = ?")
        .bind(plan_id)
        .fetch_all(pool)
        .await?;
    let node_count = rows.len() as i64;
    for row in rows {
        let node_type: String = row.get("node_type");
        let status: String = row.get("status");
        if let Err(e) = validate_status_for_node_type(&node_type, &status) {
            let mut finding = DoctorFinding::new(
                "PLAN_BAD_STATUS",
                e.to_string(),
                "READY_TO_CHECK is only legal for ACTION nodes; fix the status or regenerate.",
            );
            finding.task_id = Some(row.get("task_id"));
            finding.task_title = Some(row.get("title"));
            findings.push(finding);
        }
    }

    let decompose_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_edges WHERE plan_id = ? AND edge_type = 'DECOMPOSE'",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await?;
    if node_count > 1 && decompose_count == 0 {
        findings.push(DoctorFinding::new(
            "PLAN_MISSING_DECOMPOSE",
            format!(
                "plan has {} nodes but 0 DECOMPOSE edges (root aggregation cannot complete)",
                node_count
            ),
            "Run repair-db to backfill DECOMPOSE edges, or regenerate the plan.",
        ));
    }

    if config.workflow_mode == "v2" {
        findings.extend(doctor_plan_v2(pool, plan_id, config).await?);
    }

    Ok(findings)
}

/// Strong-workflow checks: 1:1 ACTION↔CHECK binding, v2 metadata presence,
/// and the one-shot sizing threshold for leaf ACTIONs.
async fn doctor_plan_v2(
    pool: &SqlitePool,
    plan_id: &str,
    config: &RuntimeConfig,
) -> anyhow::Result<Vec<DoctorFinding>> {
    let mut findings = Vec::new();

    let actions = sqlx::query(
        "SELECT task_id, title, estimated_person_days, deliverable_spec_json, acceptance_criteria_json
         FROM task_nodes WHERE plan_id = ? AND node_type = 'ACTION'",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    for action in &actions {
        let task_id: String = action.get("task_id");
        let title: String = action.get("title");
        let estimated: Option<f64> = action.get("estimated_person_days");
        let deliverable: Option<String> = action.get("deliverable_spec_json");
        let acceptance: Option<String> = action.get("acceptance_criteria_json");

        let mut missing = Vec::new();
        if estimated.is_none() {
            missing.push("estimated_person_days");
        }
        if deliverable.as_deref().map(str::trim).filter(|s| !s.is_empty()).is_none() {
            missing.push("deliverable_spec");
        }
        if acceptance.as_deref().map(str::trim).filter(|s| !s.is_empty()).is_none() {
            missing.push("acceptance_criteria");
        }
        if !missing.is_empty() {
            let mut finding = DoctorFinding::new(
                "V2_ACTION_METADATA_MISSING",
                format!("ACTION missing v2 fields: {}", missing.join(", ")),
                "Regenerate the plan in v2 mode so every ACTION declares its deliverable.",
            );
            finding.task_id = Some(task_id.clone());
            finding.task_title = Some(title.clone());
            findings.push(finding);
        }

        if let Some(days) = estimated {
            if days > config.one_shot_threshold_person_days {
                let mut finding = DoctorFinding::new(
                    "V2_ACTION_TOO_LARGE",
                    format!(
                        "ACTION estimated at {} person-days exceeds one_shot_threshold_person_days ({})",
                        days, config.one_shot_threshold_person_days
                    ),
                    "Decompose the ACTION further, or raise one_shot_threshold_person_days.",
                );
                finding.task_id = Some(task_id.clone());
                finding.task_title = Some(title.clone());
                findings.push(finding);
            }
        }

        // Exactly one CHECK must name this ACTION.
        let checks: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM task_nodes
             WHERE plan_id = ? AND node_type = 'CHECK' AND review_target_task_id = ?",
        )
        .bind(plan_id)
        .bind(&task_id)
        .fetch_one(pool)
        .await?;
        if checks != 1 {
            let mut finding = DoctorFinding::new(
                "V2_ACTION_CHECK_BINDING",
                format!("ACTION has {} CHECK node(s); exactly one is required", checks),
                "Regenerate in v2 mode: every ACTION pairs with exactly one CHECK.",
            );
            finding.task_id = Some(task_id);
            finding.task_title = Some(title);
            findings.push(finding);
        }
    }

    // Every CHECK must name exactly one existing ACTION.
    let dangling_checks = sqlx::query(
        "SELECT c.task_id, c.title
         FROM task_nodes c
         LEFT JOIN task_nodes t
           ON t.task_id = c.review_target_task_id AND t.node_type = 'ACTION'
         WHERE c.plan_id = ? AND c.node_type = 'CHECK'
           AND (c.review_target_task_id IS NULL OR t.task_id IS NULL)",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    for check in dangling_checks {
        let mut finding = DoctorFinding::new(
            "V2_CHECK_TARGET_MISSING",
            "CHECK does not name exactly one ACTION via review_target_task_id".to_string(),
            "Regenerate in v2 mode with 1:1 ACTION↔CHECK bindings.",
        );
        finding.task_id = Some(check.get("task_id"));
        finding.task_title = Some(check.get("title"));
        findings.push(finding);
    }

    Ok(findings)
}

pub async fn run_doctor(
    pool: &SqlitePool,
    plan_id: Option<&str>,
    config: &RuntimeConfig,
) -> anyhow::Result<Vec<DoctorFinding>> {
    let mut findings = doctor_db(pool).await?;
    if let Some(plan_id) = plan_id {
        findings.extend(doctor_plan(pool, plan_id, config).await?);
    }
    Ok(findings)
}

pub fn format_findings(findings: &[DoctorFinding]) -> String {
    if findings.is_empty() {
        return "OK".to_string();
    }
    let mut lines = Vec::new();
    for finding in findings {
        let mut head = format!("- {}: {}", finding.code, finding.message);
        if let Some(title) = &finding.task_title {
            head.push_str(&format!(" (task={})", title));
        }
        lines.push(head);
        if !finding.hint.is_empty() {
            lines.push(format!("  hint: {}", finding.hint));
        }
        if let Some(task_id) = &finding.task_id {
            lines.push(format!("  task_id: {}", task_id));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{normalize_and_validate, ContractContext, Scope};
    use crate::plan_import::upsert_plan;
    use crate::store::Store;
    use serde_json::json;

    #[tokio::test]
    async fn test_fresh_db_passes() {
        let store = Store::open_in_memory().await.unwrap();
        let findings = doctor_db(store.pool()).await.unwrap();
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[tokio::test]
    async fn test_valid_plan_passes() {
        let store = Store::open_in_memory().await.unwrap();
        let raw = json!({
            "plan": {"title": "Ok plan"},
            "nodes": [{"id": "a", "type": "ACTION", "title": "Do it"}],
        });
        let (normalized, _) =
            normalize_and_validate(Scope::PlanGen, &raw, &ContractContext::default());
        let plan_id = upsert_plan(store.pool(), &normalized).await.unwrap();

        let findings = run_doctor(store.pool(), Some(&plan_id), &RuntimeConfig::default())
            .await
            .unwrap();
        assert!(findings.is_empty(), "{}", format_findings(&findings));
    }

    #[tokio::test]
    async fn test_missing_plan_reported() {
        let store = Store::open_in_memory().await.unwrap();
        let findings = doctor_plan(store.pool(), "nope", &RuntimeConfig::default())
            .await
            .unwrap();
        assert_eq!(findings[0].code, "PLAN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_illegal_status_reported() {
        let store = Store::open_in_memory().await.unwrap();
        let raw = json!({
            "plan": {"title": "Bad status"},
            "nodes": [{"id": "a", "type": "ACTION", "title": "Do it"}],
        });
        let (normalized, _) =
            normalize_and_validate(Scope::PlanGen, &raw, &ContractContext::default());
        let plan_id = upsert_plan(store.pool(), &normalized).await.unwrap();

        sqlx::query(
            "UPDATE task_nodes SET status = 'READY_TO_CHECK' WHERE plan_id = ? AND node_type = 'GOAL'",
        )
        .bind(&plan_id)
        .execute(store.pool())
        .await
        .unwrap();

        let findings = doctor_plan(store.pool(), &plan_id, &RuntimeConfig::default())
            .await
            .unwrap();
        assert!(findings.iter().any(|f| f.code == "PLAN_BAD_STATUS"));
    }

    #[tokio::test]
    async fn test_v2_mode_requires_action_metadata_and_check() {
        let store = Store::open_in_memory().await.unwrap();
        let raw = json!({
            "plan": {"title": "v1 plan in v2 mode"},
            "nodes": [{"id": "a", "type": "ACTION", "title": "Do it"}],
        });
        let (normalized, _) =
            normalize_and_validate(Scope::PlanGen, &raw, &ContractContext::default());
        let plan_id = upsert_plan(store.pool(), &normalized).await.unwrap();

        let config: RuntimeConfig =
            serde_json::from_str(r#"{"workflow_mode": "v2"}"#).unwrap();
        let findings = doctor_plan(store.pool(), &plan_id, &config).await.unwrap();
        assert!(findings.iter().any(|f| f.code == "V2_ACTION_METADATA_MISSING"));
        assert!(findings.iter().any(|f| f.code == "V2_ACTION_CHECK_BINDING"));
    }

    #[tokio::test]
    async fn test_v2_oversized_action_flagged() {
        let store = Store::open_in_memory().await.unwrap();
        let raw = json!({
            "plan": {"title": "Big action"},
            "nodes": [
                {"id": "a", "type": "ACTION", "title": "Huge",
                 "estimated_person_days": 30.0,
                 "deliverable_spec": {"filename": "out.md"},
                 "acceptance_criteria": ["done"]},
                {"id": "c", "type": "CHECK", "title": "Check huge", "owner": "xiaojing",
                 "review_target_task_id": "a"},
            ],
        });
        let (normalized, err) =
            normalize_and_validate(Scope::PlanGen, &raw, &ContractContext::default());
        assert!(err.is_none(), "{:?}", err);
        // review_target_task_id survived normalization with the mapped id.
        let plan_id = upsert_plan(store.pool(), &normalized).await.unwrap();

        let config: RuntimeConfig =
            serde_json::from_str(r#"{"workflow_mode": "v2"}"#).unwrap();
        let findings = doctor_plan(store.pool(), &plan_id, &config).await.unwrap();
        assert!(findings.iter().any(|f| f.code == "V2_ACTION_TOO_LARGE"));
    }
}
