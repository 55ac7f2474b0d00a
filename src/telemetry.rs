//! LM call telemetry.
//!
//! One row per LM exchange, success or not. Recording is best-effort: a
//! telemetry failure must never break a workflow, so errors are logged and
//! swallowed here and an "UNKNOWN" id is returned.

use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::util::{new_uuid, utc_now_iso};

#[derive(Debug, Clone, Default)]
pub struct LlmCallRecord {
    pub plan_id: Option<String>,
    pub task_id: Option<String>,
    pub agent: String,
    pub scope: String,
    pub started_at_ts: Option<f64>,
    pub finished_at_ts: Option<f64>,
    pub shared_prompt_version: Option<String>,
    pub shared_prompt_hash: Option<String>,
    pub agent_prompt_version: Option<String>,
    pub agent_prompt_hash: Option<String>,
    pub prompt_text: String,
    pub response_text: String,
    pub parsed_json: Option<JsonValue>,
    pub normalized_json: Option<JsonValue>,
    pub validator_error: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub meta: Option<JsonValue>,
}

pub async fn record_llm_call(pool: &SqlitePool, record: &LlmCallRecord) -> String {
    let llm_call_id = new_uuid();
    let result = sqlx::query(
        "INSERT INTO llm_calls(
            llm_call_id, created_at, started_at_ts, finished_at_ts,
            plan_id, task_id, agent, scope,
            shared_prompt_version, shared_prompt_hash,
            agent_prompt_version, agent_prompt_hash,
            prompt_text, response_text,
            parsed_json, normalized_json,
            validator_error, error_code, error_message, meta_json
        ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&llm_call_id)
    .bind(utc_now_iso())
    .bind(record.started_at_ts)
    .bind(record.finished_at_ts)
    .bind(&record.plan_id)
    .bind(&record.task_id)
    .bind(&record.agent)
    .bind(&record.scope)
    .bind(&record.shared_prompt_version)
    .bind(&record.shared_prompt_hash)
    .bind(&record.agent_prompt_version)
    .bind(&record.agent_prompt_hash)
    .bind(&record.prompt_text)
    .bind(&record.response_text)
    .bind(record.parsed_json.as_ref().map(|v| v.to_string()))
    .bind(record.normalized_json.as_ref().map(|v| v.to_string()))
    .bind(&record.validator_error)
    .bind(&record.error_code)
    .bind(&record.error_message)
    .bind(record.meta.as_ref().map(|v| v.to_string()))
    .execute(pool)
    .await;

    match result {
        Ok(_) => llm_call_id,
        Err(e) => {
            warn!(error = %e, "failed to persist llm_calls row");
            "UNKNOWN".to_string()
        }
    }
}

/// Back-fill the plan_id on the most recent call of a scope. Used by the
/// create-plan workflow once the generated plan's id is known.
pub async fn backfill_plan_id(pool: &SqlitePool, llm_call_id: &str, plan_id: &str) {
    let result = sqlx::query("UPDATE llm_calls SET plan_id = ? WHERE llm_call_id = ?")
        .bind(plan_id)
        .bind(llm_call_id)
        .execute(pool)
        .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to backfill llm_calls.plan_id");
    }
}

/// Attach a validator failure to an already-recorded call.
pub async fn attach_validator_error(pool: &SqlitePool, llm_call_id: &str, validator_error: &str) {
    let result = sqlx::query(
        "UPDATE llm_calls SET validator_error = ?, error_code = COALESCE(error_code, 'LLM_UNPARSEABLE')
         WHERE llm_call_id = ?",
    )
    .bind(validator_error)
    .bind(llm_call_id)
    .execute(pool)
    .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to attach validator_error");
    }
}

/// Attach the normalized form (and clear the validator error) once a
/// response passes the contract.
pub async fn attach_normalized(pool: &SqlitePool, llm_call_id: &str, normalized: &JsonValue) {
    let result = sqlx::query(
        "UPDATE llm_calls SET normalized_json = ?, validator_error = NULL WHERE llm_call_id = ?",
    )
    .bind(normalized.to_string())
    .bind(llm_call_id)
    .execute(pool)
    .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to attach normalized_json");
    }
}

#[derive(Debug, Clone)]
pub struct LlmCallSummary {
    pub llm_call_id: String,
    pub created_at: String,
    pub plan_id: Option<String>,
    pub task_id: Option<String>,
    pub agent: String,
    pub scope: String,
    pub error_code: Option<String>,
    pub validator_error: Option<String>,
    pub normalized_json: Option<String>,
}

pub async fn list_calls(
    pool: &SqlitePool,
    plan_id: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<LlmCallSummary>> {
    let rows = match plan_id {
        Some(pid) => {
            sqlx::query(
                "SELECT llm_call_id, created_at, plan_id, task_id, agent, scope,
                        error_code, validator_error, normalized_json
                 FROM llm_calls WHERE plan_id = ?
                 ORDER BY created_at DESC LIMIT ?",
            )
            .bind(pid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT llm_call_id, created_at, plan_id, task_id, agent, scope,
                        error_code, validator_error, normalized_json
                 FROM llm_calls ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .into_iter()
        .map(|row| LlmCallSummary {
            llm_call_id: row.get("llm_call_id"),
            created_at: row.get("created_at"),
            plan_id: row.get("plan_id"),
            task_id: row.get("task_id"),
            agent: row.get("agent"),
            scope: row.get("scope"),
            error_code: row.get("error_code"),
            validator_error: row.get("validator_error"),
            normalized_json: row.get("normalized_json"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_record_and_list() {
        let store = Store::open_in_memory().await.unwrap();
        let id = record_llm_call(
            store.pool(),
            &LlmCallRecord {
                agent: "xiaobo".to_string(),
                scope: "PLAN_GEN".to_string(),
                prompt_text: "p".to_string(),
                response_text: "r".to_string(),
                ..Default::default()
            },
        )
        .await;
        assert_ne!(id, "UNKNOWN");

        backfill_plan_id(store.pool(), &id, "plan-1").await;
        let calls = list_calls(store.pool(), Some("plan-1"), 10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].scope, "PLAN_GEN");
    }

    #[tokio::test]
    async fn test_attach_normalized_clears_validator_error() {
        let store = Store::open_in_memory().await.unwrap();
        let id = record_llm_call(
            store.pool(),
            &LlmCallRecord {
                agent: "xiaojing".to_string(),
                scope: "TASK_CHECK".to_string(),
                prompt_text: "p".to_string(),
                response_text: "r".to_string(),
                validator_error: Some("missing key: total_score".to_string()),
                ..Default::default()
            },
        )
        .await;

        attach_normalized(store.pool(), &id, &serde_json::json!({"total_score": 95})).await;
        let calls = list_calls(store.pool(), None, 10).await.unwrap();
        assert!(calls[0].validator_error.is_none());
        assert!(calls[0].normalized_json.is_some());
    }
}
