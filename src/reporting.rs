//! CLI reporting: status, errors, llm-calls, and the contract audit.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::contracts::{normalize_and_validate, ContractContext, Scope};
use crate::errors::ErrorCode;
use crate::model::TaskEvent;
use crate::store::Store;
use crate::util::truncate_str;

pub async fn render_status(store: &Store, plan_id: &str) -> anyhow::Result<String> {
    let pool = store.pool();
    let Some(plan) = store.get_plan(plan_id).await? else {
        return Ok(format!("plan not found: {}", plan_id));
    };

    let mut lines = vec![
        format!("plan: {} ({})", plan.title, plan_id),
        format!(
            "owner: {}  root: {}  created_at: {}",
            plan.owner_agent_id, plan.root_task_id, plan.created_at
        ),
    ];
    if plan.constraints.is_object() {
        lines.push(format!("constraints: {}", plan.constraints));
    }
    lines.push(String::new());

    // Status histogram first, then the per-task list.
    let counts = sqlx::query(
        "SELECT status, COUNT(1) AS n FROM task_nodes
         WHERE plan_id = ? AND active_branch = 1
         GROUP BY status ORDER BY n DESC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    let summary: Vec<String> = counts
        .iter()
        .map(|row| format!("{}={}", row.get::<String, _>("status"), row.get::<i64, _>("n")))
        .collect();
    lines.push(format!("status: {}", summary.join(" ")));
    lines.push(String::new());

    let tasks = sqlx::query(
        "SELECT task_id, node_type, title, status, blocked_reason, attempt_count,
                approved_artifact_id
         FROM task_nodes WHERE plan_id = ? AND active_branch = 1
         ORDER BY priority DESC, created_at ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    for task in tasks {
        let status: String = task.get("status");
        let blocked: Option<String> = task.get("blocked_reason");
        let approved: Option<String> = task.get("approved_artifact_id");
        let mut line = format!(
            "  [{:6}] {:24} {} (attempts={})",
            task.get::<String, _>("node_type"),
            match &blocked {
                Some(reason) => format!("{}({})", status, reason),
                None => status.clone(),
            },
            truncate_str(&task.get::<String, _>("title"), 60),
            task.get::<i64, _>("attempt_count"),
        );
        if approved.is_some() {
            line.push_str(" [approved]");
        }
        lines.push(line);
        if status == "BLOCKED" {
            if let Some(hint) = blocked_hint(blocked.as_deref()) {
                lines.push(format!("        next: {}", hint));
            }
        }
    }
    Ok(lines.join("\n"))
}

fn blocked_hint(reason: Option<&str>) -> Option<&'static str> {
    match reason {
        Some("WAITING_INPUT") => {
            Some("place the file named in required_docs/<task_id>.md under inputs/<requirement_name>/")
        }
        Some("WAITING_EXTERNAL") => Some("inspect reviews/<task_id>/, then run reset-failed to retry"),
        Some("WAITING_SKILL") => Some("a tool failed; check skill_runs and re-run"),
        Some("WAITING_APPROVAL") => Some("an approval is pending"),
        _ => None,
    }
}

pub async fn render_errors(
    pool: &SqlitePool,
    plan_id: &str,
    limit: i64,
) -> anyhow::Result<String> {
    let rows = sqlx::query(
        "SELECT event_id, plan_id, task_id, event_type, payload_json, created_at
         FROM task_events
         WHERE plan_id = ? AND event_type = 'ERROR'
         ORDER BY created_at DESC LIMIT ?",
    )
    .bind(plan_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let events: Vec<TaskEvent> = rows
        .into_iter()
        .map(|row| TaskEvent {
            event_id: row.get("event_id"),
            plan_id: row.get("plan_id"),
            task_id: row.get("task_id"),
            event_type: row.get("event_type"),
            payload: serde_json::from_str(&row.get::<String, _>("payload_json"))
                .unwrap_or_default(),
            created_at: row.get("created_at"),
        })
        .collect();

    if events.is_empty() {
        return Ok("no errors recorded".to_string());
    }
    let mut lines = Vec::new();
    for event in events {
        let code = event
            .payload
            .get("error_code")
            .and_then(Value::as_str)
            .unwrap_or("?");
        let message = event
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("");
        lines.push(format!(
            "{} [{}] task={} {}",
            event.created_at,
            code,
            event.task_id.as_deref().unwrap_or("-"),
            truncate_str(message, 120),
        ));
        if let Some(hint) = event.payload.get("hint").and_then(Value::as_str) {
            lines.push(format!("    hint: {}", hint));
        }
    }
    Ok(lines.join("\n"))
}

pub async fn render_llm_calls(
    pool: &SqlitePool,
    plan_id: Option<&str>,
    limit: i64,
) -> anyhow::Result<String> {
    let calls = crate::telemetry::list_calls(pool, plan_id, limit).await?;
    if calls.is_empty() {
        return Ok("no llm calls recorded".to_string());
    }
    let mut lines = Vec::new();
    for call in calls {
        let outcome = call
            .error_code
            .or(call.validator_error.map(|_| "VALIDATOR".to_string()))
            .unwrap_or_else(|| "ok".to_string());
        lines.push(format!(
            "{} {:12} {:12} task={} {} [{}]",
            call.created_at,
            call.agent,
            call.scope,
            call.task_id.unwrap_or_else(|| "-".to_string()),
            call.llm_call_id,
            outcome,
        ));
    }
    Ok(lines.join("\n"))
}

#[derive(Debug, Default)]
pub struct ContractAuditReport {
    pub audited: u64,
    pub drifted: Vec<String>,
    pub invalid: Vec<String>,
}

/// Re-normalize every persisted normalized response and verify identity:
/// normalization of an already-normalized document must change nothing.
pub async fn contract_audit(
    pool: &SqlitePool,
    plan_id: Option<&str>,
    limit: i64,
) -> anyhow::Result<ContractAuditReport> {
    let calls = crate::telemetry::list_calls(pool, plan_id, limit).await?;
    let mut report = ContractAuditReport::default();

    for call in calls {
        let Some(normalized_json) = call.normalized_json else { continue };
        let Ok(stored) = serde_json::from_str::<Value>(&normalized_json) else {
            report.invalid.push(call.llm_call_id.clone());
            continue;
        };
        let scope = match call.scope.as_str() {
            "PLAN_GEN" => Scope::PlanGen,
            "PLAN_REVIEW" => Scope::PlanReview,
            "TASK_ACTION" => Scope::TaskAction,
            "TASK_CHECK" => Scope::TaskCheck,
            _ => continue,
        };
        report.audited += 1;

        let ctx = ContractContext {
            task_id: call.task_id.clone().unwrap_or_default(),
            plan_id: call.plan_id.clone().unwrap_or_default(),
            top_task: String::new(),
        };
        let (renormalized, err) = normalize_and_validate(scope, &stored, &ctx);
        if err.is_some() {
            report.invalid.push(call.llm_call_id.clone());
        } else if renormalized != stored {
            report.drifted.push(call.llm_call_id.clone());
        }
    }
    Ok(report)
}

pub fn format_audit(report: &ContractAuditReport) -> String {
    let mut lines = vec![format!("audited: {}", report.audited)];
    if report.drifted.is_empty() && report.invalid.is_empty() {
        lines.push("round-trip: OK (re-normalization is the identity)".to_string());
    }
    for id in &report.drifted {
        lines.push(format!("DRIFT {} (re-normalization changed the document)", id));
    }
    for id in &report.invalid {
        lines.push(format!(
            "{} {} (stored normalized document no longer validates)",
            ErrorCode::LlmUnparseable.as_str(),
            id
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::telemetry::{attach_normalized, record_llm_call, LlmCallRecord};
    use serde_json::json;

    #[tokio::test]
    async fn test_contract_audit_round_trip_holds() {
        let store = Store::open_in_memory().await.unwrap();
        let id = record_llm_call(
            store.pool(),
            &LlmCallRecord {
                agent: "xiaojing".to_string(),
                scope: "TASK_CHECK".to_string(),
                task_id: Some("t1".to_string()),
                prompt_text: "p".to_string(),
                response_text: "r".to_string(),
                ..Default::default()
            },
        )
        .await;

        let raw = json!({"review_result": {"total_score": 85, "action_required": "MODIFY"},
                         "summary": "needs work"});
        let ctx = ContractContext { task_id: "t1".to_string(), ..Default::default() };
        let (normalized, err) = normalize_and_validate(Scope::TaskCheck, &raw, &ctx);
        assert!(err.is_none());
        attach_normalized(store.pool(), &id, &normalized).await;

        let report = contract_audit(store.pool(), None, 100).await.unwrap();
        assert_eq!(report.audited, 1);
        assert!(report.drifted.is_empty(), "{:?}", report.drifted);
        assert!(report.invalid.is_empty());
    }

    #[tokio::test]
    async fn test_status_renders_blocked_hint() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO plans(plan_id, title, owner_agent_id, root_task_id, created_at)
             VALUES('p1', 'Demo', 'xiaobo', 't1', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO task_nodes(task_id, plan_id, node_type, title, owner_agent_id,
                                    status, blocked_reason, created_at, updated_at)
             VALUES('t1', 'p1', 'ACTION', 'Needs spec', 'xiaobo', 'BLOCKED', 'WAITING_INPUT',
                    '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let out = render_status(&store, "p1").await.unwrap();
        assert!(out.contains("BLOCKED(WAITING_INPUT)"));
        assert!(out.contains("required_docs"));
    }
}
