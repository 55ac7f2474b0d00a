//! CreatePlan: the generate → review → retry sub-workflow.
//!
//! Runs once before the main loop. Each attempt generates a plan, validates
//! it against `plan_json_v1`, and puts it in front of the reviewer. Reviewer
//! shape failures retry the reviewer only; content rejections distill the
//! suggestions into a short remediation note for the next generation attempt
//! (never raw reviewer JSON). Only an approved plan is committed.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::contracts::{normalize_and_validate, ContractContext, Scope};
use crate::errors::{record_error, ErrorCode};
use crate::events::{emit_event, EVENT_PLAN_APPROVED, EVENT_PLAN_REVIEWED};
use crate::llm::CallMeta;
use crate::model::{ReviewAction, AGENT_EXECUTOR, AGENT_REVIEWER};
use crate::plan_import::{ensure_plan_stub, upsert_plan};
use crate::prompts::{build_plan_prompt, build_plan_review_prompt};
use crate::telemetry::{attach_normalized, attach_validator_error, backfill_plan_id};
use crate::util::truncate_str;

/// Retry notes are bounded so feedback can never snowball the prompt.
pub const MAX_RETRY_NOTE_CHARS: usize = 500;

#[derive(Debug)]
pub struct PlanNotApproved {
    pub attempts: u32,
    pub last_reason: String,
}

impl std::fmt::Display for PlanNotApproved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempts: {}",
            ErrorCode::PlanNotApproved.as_str(),
            self.attempts,
            self.last_reason
        )
    }
}

impl std::error::Error for PlanNotApproved {}

#[derive(Debug)]
pub struct PlanWorkflowResult {
    pub plan_id: String,
    pub plan_json: Value,
    pub review_json: Value,
    pub plan_path: PathBuf,
}

/// Compress reviewer suggestions into a short, human-shaped remediation
/// note. High-priority items first; bounded at [`MAX_RETRY_NOTE_CHARS`].
pub fn distill_retry_notes(review: &Value) -> String {
    let mut suggestions: Vec<&Value> = review
        .get("suggestions")
        .and_then(Value::as_array)
        .map(|items| items.iter().collect())
        .unwrap_or_default();
    let rank = |s: &&Value| match s.get("priority").and_then(Value::as_str) {
        Some("HIGH") => 0,
        Some("MED") => 1,
        _ => 2,
    };
    suggestions.sort_by_key(rank);

    let mut lines: Vec<String> = suggestions
        .iter()
        .take(3)
        .filter_map(|s| s.get("change").and_then(Value::as_str))
        .map(|change| format!("- {}", change.trim()))
        .collect();
    if lines.is_empty() {
        if let Some(summary) = review.get("summary").and_then(Value::as_str) {
            lines.push(format!("- {}", summary.trim()));
        }
    }
    truncate_str(&lines.join("\n"), MAX_RETRY_NOTE_CHARS)
}

pub async fn generate_and_review_plan(
    ctx: &EngineContext,
    top_task: &str,
    constraints: Option<Value>,
) -> anyhow::Result<PlanWorkflowResult> {
    let pool = ctx.pool();
    let constraints = constraints.unwrap_or_else(|| json!({"deadline": null, "priority": "HIGH"}));
    let skills: Vec<String> = ctx.skills.keys().map(|k| k.to_string()).collect();

    let mut retry_notes = String::new();
    let mut last_reason = String::new();

    for attempt in 1..=ctx.config.max_plan_attempts {
        // ---------------- PLAN_GEN ----------------
        let mut plan_prompt =
            build_plan_prompt(&ctx.prompts, top_task, &constraints, &skills, &retry_notes);
        plan_prompt.push_str(&format!(
            "\n## Depth limit\nDecompose at most {} levels deep.\n",
            ctx.config.max_decomposition_depth
        ));
        let meta = CallMeta {
            agent: AGENT_EXECUTOR.to_string(),
            scope: Scope::PlanGen.as_str().to_string(),
            shared_prompt_version: Some(ctx.prompts.shared.version.clone()),
            shared_prompt_hash: Some(ctx.prompts.shared.sha256.clone()),
            agent_prompt_version: Some(ctx.prompts.planner.version.clone()),
            agent_prompt_hash: Some(ctx.prompts.planner.sha256.clone()),
            attempt: Some(attempt as i64),
            retry_reason: if retry_notes.is_empty() { None } else { Some(retry_notes.clone()) },
            ..Default::default()
        };
        let exchange = ctx.llm.call_json(pool, &meta, &plan_prompt).await;

        let Some(parsed) = exchange.parsed.as_ref() else {
            last_reason = exchange
                .error
                .clone()
                .unwrap_or_else(|| "plan generation produced no JSON".to_string());
            warn!(attempt, reason = %last_reason, "plan generation failed");
            retry_notes = truncate_str(
                &format!("The previous attempt failed to produce parseable JSON: {}", last_reason),
                MAX_RETRY_NOTE_CHARS,
            );
            continue;
        };

        let contract_ctx = ContractContext {
            task_id: String::new(),
            plan_id: String::new(),
            top_task: top_task.to_string(),
        };
        let (plan_json, contract_err) = normalize_and_validate(Scope::PlanGen, parsed, &contract_ctx);

        let plan_id = plan_json["plan"]["plan_id"].as_str().unwrap_or("").to_string();
        let root_task_id = plan_json["plan"]["root_task_id"].as_str().unwrap_or("").to_string();
        let title = plan_json["plan"]["title"].as_str().unwrap_or("Untitled Plan");
        if !plan_id.is_empty() {
            // Event/telemetry foreign keys need a plans row even while the
            // plan is still unapproved.
            ensure_plan_stub(pool, &plan_id, title, AGENT_EXECUTOR, &root_task_id, &constraints).await?;
            backfill_plan_id(pool, &exchange.llm_call_id, &plan_id).await;
        }

        if let Some(err) = contract_err {
            last_reason = err.short();
            attach_validator_error(pool, &exchange.llm_call_id, &last_reason).await;
            if !plan_id.is_empty() {
                record_error(
                    pool,
                    &plan_id,
                    None,
                    ErrorCode::PlanInvalid,
                    &last_reason,
                    json!({"validator_error": err.to_json()}),
                )
                .await?;
            }
            retry_notes = truncate_str(
                &format!("Plan JSON schema validation error (must fix): {}", last_reason),
                MAX_RETRY_NOTE_CHARS,
            );
            continue;
        }
        attach_normalized(pool, &exchange.llm_call_id, &plan_json).await;

        // ---------------- PLAN_REVIEW (nested retries) ----------------
        let review_prompt = build_plan_review_prompt(&ctx.prompts, &plan_id, &plan_json);
        let mut review: Option<Value> = None;
        for review_attempt in 1..=ctx.config.max_review_attempts {
            let meta = CallMeta {
                plan_id: Some(plan_id.clone()),
                agent: AGENT_REVIEWER.to_string(),
                scope: Scope::PlanReview.as_str().to_string(),
                shared_prompt_version: Some(ctx.prompts.shared.version.clone()),
                shared_prompt_hash: Some(ctx.prompts.shared.sha256.clone()),
                agent_prompt_version: Some(ctx.prompts.reviewer.version.clone()),
                agent_prompt_hash: Some(ctx.prompts.reviewer.sha256.clone()),
                attempt: Some(attempt as i64),
                review_attempt: Some(review_attempt as i64),
                ..Default::default()
            };
            let exchange = ctx.llm.call_json(pool, &meta, &review_prompt).await;

            let Some(parsed) = exchange.parsed.as_ref() else {
                last_reason = exchange
                    .error
                    .clone()
                    .unwrap_or_else(|| "plan review produced no JSON".to_string());
                record_error(
                    pool,
                    &plan_id,
                    None,
                    exchange.error_code.unwrap_or(ErrorCode::LlmFailed),
                    &last_reason,
                    json!({"llm_call_id": exchange.llm_call_id, "review_attempt": review_attempt}),
                )
                .await?;
                continue;
            };

            let review_ctx = ContractContext {
                task_id: String::new(),
                plan_id: plan_id.clone(),
                top_task: String::new(),
            };
            let (normalized, contract_err) =
                normalize_and_validate(Scope::PlanReview, parsed, &review_ctx);
            match contract_err {
                Some(err) => {
                    last_reason = err.short();
                    attach_validator_error(pool, &exchange.llm_call_id, &last_reason).await;
                    record_error(
                        pool,
                        &plan_id,
                        None,
                        ErrorCode::LlmUnparseable,
                        &last_reason,
                        json!({"llm_call_id": exchange.llm_call_id, "review_attempt": review_attempt}),
                    )
                    .await?;
                }
                None => {
                    attach_normalized(pool, &exchange.llm_call_id, &normalized).await;
                    review = Some(normalized);
                    break;
                }
            }
        }

        let Some(review) = review else {
            retry_notes = truncate_str(
                &format!(
                    "The plan reviewer could not produce a valid verdict (last error: {}). \
                     Emit a simpler, strictly conforming plan.",
                    last_reason
                ),
                MAX_RETRY_NOTE_CHARS,
            );
            continue;
        };

        let total_score = review.get("total_score").and_then(Value::as_i64).unwrap_or(0);
        let action = review
            .get("action_required")
            .and_then(Value::as_str)
            .and_then(ReviewAction::from_str)
            .unwrap_or(ReviewAction::Modify);

        if total_score >= ctx.config.plan_review_pass_score && action == ReviewAction::Approve {
            let plan_path = ctx.workspace.plan_path();
            if let Some(parent) = plan_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&plan_path, serde_json::to_string_pretty(&plan_json)?).await?;
            upsert_plan(pool, &plan_json).await?;
            emit_event(
                pool,
                &plan_id,
                None,
                EVENT_PLAN_APPROVED,
                json!({"total_score": total_score, "attempt": attempt}),
            )
            .await?;
            info!(plan_id = %plan_id, score = total_score, attempt, "plan approved");
            return Ok(PlanWorkflowResult {
                plan_id,
                plan_json,
                review_json: review,
                plan_path,
            });
        }

        emit_event(
            pool,
            &plan_id,
            None,
            EVENT_PLAN_REVIEWED,
            json!({
                "total_score": total_score,
                "action_required": action.as_str(),
                "attempt": attempt,
            }),
        )
        .await?;

        last_reason = format!(
            "rejected with score {} ({})",
            total_score,
            action.as_str()
        );
        retry_notes = distill_retry_notes(&review);
    }

    Err(anyhow::anyhow!(PlanNotApproved {
        attempts: ctx.config.max_plan_attempts,
        last_reason,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distill_prefers_high_priority_and_stays_bounded() {
        let review = json!({
            "suggestions": [
                {"priority": "LOW", "change": "polish wording"},
                {"priority": "HIGH", "change": "add DECOMPOSE edges from the root"},
                {"priority": "MED", "change": "declare the product_spec requirement"},
                {"priority": "HIGH", "change": "x".repeat(600)},
            ],
        });
        let notes = distill_retry_notes(&review);
        assert!(notes.starts_with("- add DECOMPOSE edges from the root"));
        assert!(notes.chars().count() <= MAX_RETRY_NOTE_CHARS);
        // Raw JSON must never leak into the next prompt.
        assert!(!notes.contains('{'));
    }

    #[test]
    fn test_distill_falls_back_to_summary() {
        let review = json!({"summary": "plan lacks a runnable ACTION", "suggestions": []});
        let notes = distill_retry_notes(&review);
        assert_eq!(notes, "- plan lacks a runnable ACTION");
    }
}
