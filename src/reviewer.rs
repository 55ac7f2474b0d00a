//! Reviewer phase: gate every candidate artifact through the reviewer LM.
//!
//! The version lock closes the obvious race: the artifact under review is
//! pinned when the review starts (`reviewed_artifact_id`); approval applies
//! to that version only, and a task whose executor produced a newer version
//! mid-review stays READY_TO_CHECK so the newer version is re-reviewed.

use serde_json::{json, Value};
use tracing::info;

use crate::artifacts::load_artifact;
use crate::context::EngineContext;
use crate::contracts::{normalize_and_validate, ContractContext, Scope};
use crate::errors::{handle_error, record_error, ErrorCode};
use crate::events::set_status;
use crate::guardrails::Guardrails;
use crate::llm::CallMeta;
use crate::model::{BlockedReason, ReviewAction, TaskNode, TaskStatus, AGENT_REVIEWER};
use crate::prompts::{build_review_prompt, ReviewContext};
use crate::reviews::{insert_review, write_review_file, write_suggestions_file};
use crate::telemetry::{attach_normalized, attach_validator_error};
use crate::util::safe_read_text;

const ARTIFACT_REVIEW_CHARS: usize = 200_000;

/// Review one READY_TO_CHECK task. Invalid reviewer output is retried
/// internally up to `max_review_attempts`; those failures never touch the
/// executor task's attempt count or mark it FAILED.
pub async fn run_reviewer_phase(
    ctx: &EngineContext,
    guardrails: &mut Guardrails,
    task: &TaskNode,
) -> anyhow::Result<()> {
    let pool = ctx.pool();
    let plan_id = task.plan_id.as_str();
    let task_id = task.task_id.as_str();

    // Version lock: pin the artifact under review before anything else.
    let Some(reviewed_artifact_id) = task.active_artifact_id.clone() else {
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::InputMissing,
            "artifact missing for review",
            json!({}),
        )
        .await?;
        return Ok(());
    };
    let Some(artifact) = load_artifact(pool, &reviewed_artifact_id).await? else {
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::InputMissing,
            "artifact row missing for review",
            json!({"artifact_id": reviewed_artifact_id}),
        )
        .await?;
        return Ok(());
    };
    let artifact_path = std::path::Path::new(&artifact.path);
    if !artifact_path.exists() {
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::InputMissing,
            "artifact file missing for review",
            json!({"path": artifact.path}),
        )
        .await?;
        return Ok(());
    }

    info!(
        task_id,
        artifact = %artifact.name,
        version = artifact.version,
        sha256 = %artifact.sha256,
        "review starting (version locked)"
    );

    let artifact_text = safe_read_text(artifact_path, ARTIFACT_REVIEW_CHARS).await?;
    let prompt = build_review_prompt(
        &ctx.prompts,
        &ReviewContext {
            task_id,
            title: &task.title,
            review_target: "NODE",
            acceptance_criteria: task.acceptance_criteria.as_ref(),
            artifact_name: &artifact.name,
            artifact_text: &artifact_text,
        },
    );

    // Inner retry loop: reviewer shape failures are the reviewer's problem.
    let mut review: Option<Value> = None;
    let mut last_reason = String::new();
    for review_attempt in 1..=ctx.config.max_review_attempts {
        if !guardrails.consume_task_budget(task_id) {
            handle_error(
                pool,
                plan_id,
                Some(task_id),
                ErrorCode::MaxAttemptsExceeded,
                "Per-task LM call budget exhausted during review",
                json!({"budget": "max_llm_calls_per_task"}),
            )
            .await?;
            return Ok(());
        }

        let meta = CallMeta {
            plan_id: Some(plan_id.to_string()),
            task_id: Some(task_id.to_string()),
            agent: AGENT_REVIEWER.to_string(),
            scope: Scope::TaskCheck.as_str().to_string(),
            shared_prompt_version: Some(ctx.prompts.shared.version.clone()),
            shared_prompt_hash: Some(ctx.prompts.shared.sha256.clone()),
            agent_prompt_version: Some(ctx.prompts.reviewer.version.clone()),
            agent_prompt_hash: Some(ctx.prompts.reviewer.sha256.clone()),
            review_attempt: Some(review_attempt as i64),
            retry_reason: if last_reason.is_empty() { None } else { Some(last_reason.clone()) },
            ..Default::default()
        };
        let exchange = ctx.llm.call_json(pool, &meta, &prompt).await;
        guardrails.record_llm_call();

        if exchange.is_err() || exchange.parsed.is_none() {
            last_reason = exchange
                .error
                .clone()
                .unwrap_or_else(|| "LM call failed".to_string());
            record_error(
                pool,
                plan_id,
                Some(task_id),
                exchange.error_code.unwrap_or(ErrorCode::LlmFailed),
                &last_reason,
                json!({"llm_call_id": exchange.llm_call_id, "review_attempt": review_attempt}),
            )
            .await?;
            continue;
        }

        let contract_ctx = ContractContext {
            task_id: task_id.to_string(),
            plan_id: plan_id.to_string(),
            top_task: String::new(),
        };
        let (normalized, contract_err) = normalize_and_validate(
            Scope::TaskCheck,
            exchange.parsed.as_ref().unwrap(),
            &contract_ctx,
        );
        match contract_err {
            Some(err) => {
                last_reason = err.short();
                attach_validator_error(pool, &exchange.llm_call_id, &last_reason).await;
                record_error(
                    pool,
                    plan_id,
                    Some(task_id),
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
        // The reviewer never produced a valid verdict. The task keeps its
        // candidate; an operator has to look at the telemetry.
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::MaxAttemptsExceeded,
            "Reviewer could not produce a valid review within its retry cap",
            json!({"last_reason": last_reason}),
        )
        .await?;
        return Ok(());
    };

    let total_score = review.get("total_score").and_then(Value::as_i64).unwrap_or(0);
    let action = review
        .get("action_required")
        .and_then(Value::as_str)
        .and_then(ReviewAction::from_str)
        .unwrap_or(ReviewAction::Modify);
    let pass = total_score >= ctx.config.plan_review_pass_score && action == ReviewAction::Approve;

    let review_id = insert_review(
        pool,
        plan_id,
        task_id,
        AGENT_REVIEWER,
        Some(&reviewed_artifact_id),
        &review,
    )
    .await?;
    write_review_file(&ctx.workspace.reviews_dir(), task_id, &review_id, &review, pass).await?;

    if pass {
        ctx.store.set_approved_artifact(task_id, &reviewed_artifact_id).await?;
        let current = ctx.store.get_task(task_id).await?;
        let active_now = current.and_then(|t| t.active_artifact_id);
        if active_now.as_deref() == Some(reviewed_artifact_id.as_str()) {
            set_status(pool, plan_id, task_id, TaskStatus::Done, None).await?;
            info!(task_id, review_id = %review_id, score = total_score, "review approved; task done");
        } else {
            // A newer version appeared during review; it needs its own pass.
            info!(
                task_id,
                approved = %reviewed_artifact_id,
                "review approved a superseded version; newer artifact awaits review"
            );
        }
        return Ok(());
    }

    let suggestions = review.get("suggestions").cloned().unwrap_or(json!([]));
    write_suggestions_file(&ctx.workspace.reviews_dir(), task_id, &suggestions).await?;

    if action == ReviewAction::RequestExternalInput {
        // Not a failure: the reviewer wants a human in the loop. The written
        // suggestions file is the guidance.
        set_status(
            pool,
            plan_id,
            task_id,
            TaskStatus::Blocked,
            Some(BlockedReason::WaitingExternal),
        )
        .await?;
        return Ok(());
    }

    // Reject: one attempt burned; escalate at the cap.
    let attempts = ctx.store.increment_attempt(task_id).await?;
    if attempts >= ctx.config.max_task_attempts {
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::MaxAttemptsExceeded,
            "Max attempts exceeded",
            json!({"review_id": review_id, "final_score": total_score}),
        )
        .await?;
    } else {
        set_status(pool, plan_id, task_id, TaskStatus::ToBeModify, None).await?;
    }
    Ok(())
}
