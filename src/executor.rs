//! Executor phase: run one scheduled ACTION through the executor LM and
//! apply the outcome.
//!
//! Context assembly: the task's goal, its input evidence (passed through
//! text extraction with a char cap), the previous review's suggestions when
//! re-working, and the approved upstream deliverables.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::artifacts::{create_and_activate_artifact, load_artifact, ArtifactCapExceeded};
use crate::context::EngineContext;
use crate::contracts::{normalize_and_validate, ContractContext, Scope};
use crate::errors::{handle_error, ErrorCode};
use crate::events::{emit_event, set_status, EVENT_INPUT_CONFLICT};
use crate::guardrails::Guardrails;
use crate::llm::CallMeta;
use crate::model::{TaskNode, TaskStatus, AGENT_EXECUTOR};
use crate::prompts::{build_action_prompt, ActionContext};
use crate::reviews::read_suggestions_file;
use crate::skills::{run_skill, SkillFailure, SkillInput, SKILL_TEXT_EXTRACT};
use crate::telemetry::{attach_normalized, attach_validator_error};
use crate::util::safe_read_text;

const EVIDENCE_SNIPPET_CHARS: usize = 20_000;
const UPSTREAM_SNIPPET_CHARS: usize = 20_000;
const EXTRACT_MAX_CHARS: u64 = 50_000;

#[derive(Debug, Clone)]
struct EvidenceFile {
    path: String,
    sha256: String,
    requirement_name: String,
}

async fn list_task_evidence(pool: &SqlitePool, task_id: &str) -> anyhow::Result<Vec<EvidenceFile>> {
    let rows = sqlx::query(
        "SELECT e.ref_path, e.sha256, r.name AS requirement_name
         FROM evidences e
         JOIN input_requirements r ON r.requirement_id = e.requirement_id
         WHERE r.task_id = ? AND e.ref_path IS NOT NULL
         ORDER BY e.added_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let path: Option<String> = row.get("ref_path");
            path.map(|path| EvidenceFile {
                path,
                sha256: row.get::<Option<String>, _>("sha256").unwrap_or_default(),
                requirement_name: row.get("requirement_name"),
            })
        })
        .collect())
}

/// Per requirement: prefer a filename containing `FINAL` (case-insensitive),
/// else the most recently modified file. Multiple non-FINAL candidates are a
/// version conflict the user must resolve.
fn select_best_inputs(
    files: &[EvidenceFile],
) -> (Vec<EvidenceFile>, Vec<Value>) {
    use std::collections::HashMap;
    let mut by_requirement: HashMap<&str, Vec<&EvidenceFile>> = HashMap::new();
    for file in files {
        by_requirement
            .entry(file.requirement_name.as_str())
            .or_default()
            .push(file);
    }

    let mut selected = Vec::new();
    let mut conflicts = Vec::new();
    let mut names: Vec<&&str> = by_requirement.keys().collect::<Vec<_>>();
    names.sort();
    for name in names {
        let candidates = &by_requirement[*name];
        let mut enriched: Vec<(bool, i64, &EvidenceFile)> = candidates
            .iter()
            .map(|file| {
                let path = Path::new(&file.path);
                let mtime = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .map(|t| {
                        t.duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0)
                    })
                    .unwrap_or(0);
                let is_final = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.to_lowercase().contains("final"))
                    .unwrap_or(false);
                (is_final, mtime, *file)
            })
            .collect();
        enriched.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.path.cmp(&b.2.path)));

        if let Some(best) = enriched.first() {
            selected.push(best.2.clone());
            if enriched.len() > 1 && !best.0 {
                conflicts.push(json!({
                    "requirement_name": name,
                    "chosen": Path::new(&best.2.path).file_name().and_then(|n| n.to_str()),
                    "candidates": enriched.iter().take(5)
                        .filter_map(|(_, _, f)| Path::new(&f.path).file_name().and_then(|n| n.to_str()))
                        .collect::<Vec<_>>(),
                }));
            }
        }
    }
    (selected, conflicts)
}

/// Content of approved deliverables this task depends on.
async fn load_upstream_artifacts(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: &str,
) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT n.approved_artifact_id
         FROM task_edges e
         JOIN task_nodes n ON n.task_id = e.from_task_id
         WHERE e.plan_id = ? AND e.to_task_id = ? AND e.edge_type = 'DEPENDS_ON'
           AND n.status = 'DONE' AND n.approved_artifact_id IS NOT NULL
         ORDER BY n.created_at ASC",
    )
    .bind(plan_id)
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    let mut texts = Vec::new();
    for row in rows {
        let Some(artifact_id) = row.get::<Option<String>, _>("approved_artifact_id") else {
            continue;
        };
        if let Some(artifact) = load_artifact(pool, &artifact_id).await? {
            let path = Path::new(&artifact.path);
            if path.exists() {
                texts.push(safe_read_text(path, UPSTREAM_SNIPPET_CHARS).await?);
            }
        }
    }
    Ok(texts)
}

async fn write_required_docs(
    required_docs_dir: &Path,
    task_id: &str,
    required_docs: &[Value],
) -> anyhow::Result<std::path::PathBuf> {
    tokio::fs::create_dir_all(required_docs_dir).await?;
    let path = required_docs_dir.join(format!("{}.md", task_id));
    let mut lines = vec![
        format!("# Required docs for task {}", task_id),
        String::new(),
        "Place each file under `inputs/<requirement_name>/` and re-run.".to_string(),
        String::new(),
    ];
    for doc in required_docs {
        let name = doc.get("name").and_then(Value::as_str).unwrap_or("");
        let description = doc.get("description").and_then(Value::as_str).unwrap_or("");
        lines.push(format!("- {}: {}", name, description));
        if let Some(types) = doc.get("accepted_types").and_then(Value::as_array) {
            if !types.is_empty() {
                let list: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
                lines.push(format!("  - accepted_types: {}", list.join(", ")));
            }
        }
        if let Some(suggested) = doc.get("suggested_path").and_then(Value::as_str) {
            lines.push(format!("  - suggested_path: {}", suggested));
        }
    }
    lines.push(String::new());
    tokio::fs::write(&path, lines.join("\n")).await?;
    Ok(path)
}

async fn attempt_exceeded(ctx: &EngineContext, task_id: &str) -> anyhow::Result<bool> {
    Ok(ctx.store.attempt_count(task_id).await? >= ctx.config.max_task_attempts)
}

async fn escalate_if_exhausted(ctx: &EngineContext, plan_id: &str, task_id: &str) -> anyhow::Result<()> {
    if attempt_exceeded(ctx, task_id).await? {
        handle_error(
            ctx.pool(),
            plan_id,
            Some(task_id),
            ErrorCode::MaxAttemptsExceeded,
            "Max attempts exceeded",
            json!({}),
        )
        .await?;
    }
    Ok(())
}

/// Run the executor once for `task`. All outcomes are persisted; the caller
/// only learns whether an LM call was spent.
pub async fn run_executor_phase(
    ctx: &EngineContext,
    guardrails: &mut Guardrails,
    task: &TaskNode,
) -> anyhow::Result<()> {
    let pool = ctx.pool();
    let plan_id = task.plan_id.as_str();
    let task_id = task.task_id.as_str();
    let prior_status = task.status;

    if !guardrails.consume_task_budget(task_id) {
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::MaxAttemptsExceeded,
            "Per-task LM call budget exhausted for this run",
            json!({"budget": "max_llm_calls_per_task"}),
        )
        .await?;
        return Ok(());
    }

    set_status(pool, plan_id, task_id, TaskStatus::InProgress, None).await?;

    // Reviewer guidance from the previous round, when re-working.
    let suggestions_text = if prior_status == TaskStatus::ToBeModify {
        read_suggestions_file(&ctx.workspace.reviews_dir(), task_id).await
    } else {
        String::new()
    };

    // Evidence selection and extraction.
    let evidence = list_task_evidence(pool, task_id).await?;
    let (selected, conflicts) = select_best_inputs(&evidence);
    if !conflicts.is_empty() {
        emit_event(
            pool,
            plan_id,
            Some(task_id),
            EVENT_INPUT_CONFLICT,
            json!({"conflicts": conflicts}),
        )
        .await?;
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::InputConflict,
            "Multiple input versions detected; keep one (or name it FINAL).",
            json!({"conflicts": conflicts}),
        )
        .await?;
        return Ok(());
    }

    let mut evidence_snippets: Vec<String> = Vec::new();
    if !selected.is_empty() {
        let inputs: Vec<SkillInput> = selected
            .iter()
            .map(|f| SkillInput {
                path: Path::new(&f.path).to_path_buf(),
                sha256: f.sha256.clone(),
            })
            .collect();
        let result = run_skill(
            pool,
            &ctx.skills,
            plan_id,
            task_id,
            SKILL_TEXT_EXTRACT,
            inputs,
            json!({"max_chars": EXTRACT_MAX_CHARS}),
            Duration::from_secs(ctx.config.skill_timeout_seconds),
        )
        .await;

        match result {
            Ok(output) => {
                ctx.store.reset_counter(plan_id, task_id, "WAITING_SKILL").await?;
                evidence_snippets = output
                    .texts
                    .into_iter()
                    .take(3)
                    .map(|t| crate::util::truncate_with_note(&t, EVIDENCE_SNIPPET_CHARS))
                    .collect();
            }
            Err(e) => {
                let code = match e.downcast_ref::<SkillFailure>().map(|f| f.code) {
                    Some("SKILL_TIMEOUT") => ErrorCode::SkillTimeout,
                    Some("SKILL_BAD_INPUT") => ErrorCode::SkillBadInput,
                    _ => ErrorCode::SkillFailed,
                };
                handle_error(
                    pool,
                    plan_id,
                    Some(task_id),
                    code,
                    &format!("{e:#}"),
                    json!({"skill": SKILL_TEXT_EXTRACT}),
                )
                .await?;
                if matches!(code, ErrorCode::SkillFailed | ErrorCode::SkillTimeout) {
                    let count = ctx
                        .store
                        .increment_counter(plan_id, task_id, "WAITING_SKILL")
                        .await?;
                    if count >= ctx.config.max_skill_retries {
                        handle_error(
                            pool,
                            plan_id,
                            Some(task_id),
                            ErrorCode::MaxAttemptsExceeded,
                            "Skill failed repeatedly; waiting for external help.",
                            json!({"skill": SKILL_TEXT_EXTRACT, "failures": count}),
                        )
                        .await?;
                    }
                }
                return Ok(());
            }
        }
    }

    let upstream = load_upstream_artifacts(pool, plan_id, task_id).await?;

    let prompt = build_action_prompt(
        &ctx.prompts,
        &ActionContext {
            task_id,
            title: &task.title,
            goal_statement: task.goal_statement.as_deref(),
            deliverable_spec: task.deliverable_spec.as_ref(),
            acceptance_criteria: task.acceptance_criteria.as_ref(),
            evidence_snippets: &evidence_snippets,
            upstream_artifacts: &upstream,
            suggestions_text: &suggestions_text,
        },
    );

    let meta = CallMeta {
        plan_id: Some(plan_id.to_string()),
        task_id: Some(task_id.to_string()),
        agent: AGENT_EXECUTOR.to_string(),
        scope: Scope::TaskAction.as_str().to_string(),
        shared_prompt_version: Some(ctx.prompts.shared.version.clone()),
        shared_prompt_hash: Some(ctx.prompts.shared.sha256.clone()),
        agent_prompt_version: Some(ctx.prompts.executor.version.clone()),
        agent_prompt_hash: Some(ctx.prompts.executor.sha256.clone()),
        attempt: Some(task.attempt_count + 1),
        ..Default::default()
    };
    let exchange = ctx.llm.call_json(pool, &meta, &prompt).await;
    guardrails.record_llm_call();

    if exchange.is_err() || exchange.parsed.is_none() {
        let code = exchange.error_code.unwrap_or(ErrorCode::LlmFailed);
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            code,
            exchange.error.as_deref().unwrap_or("LM call failed"),
            json!({"llm_call_id": exchange.llm_call_id}),
        )
        .await?;
        escalate_if_exhausted(ctx, plan_id, task_id).await?;
        return Ok(());
    }

    let contract_ctx = ContractContext {
        task_id: task_id.to_string(),
        plan_id: plan_id.to_string(),
        top_task: String::new(),
    };
    let (normalized, contract_err) =
        normalize_and_validate(Scope::TaskAction, exchange.parsed.as_ref().unwrap(), &contract_ctx);
    if let Some(err) = contract_err {
        let short = err.short();
        attach_validator_error(pool, &exchange.llm_call_id, &short).await;
        handle_error(
            pool,
            plan_id,
            Some(task_id),
            ErrorCode::LlmUnparseable,
            &short,
            json!({"llm_call_id": exchange.llm_call_id, "validator_error": err.to_json()}),
        )
        .await?;
        escalate_if_exhausted(ctx, plan_id, task_id).await?;
        return Ok(());
    }
    attach_normalized(pool, &exchange.llm_call_id, &normalized).await;

    let result_type = normalized
        .get("result_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    match result_type {
        "ARTIFACT" => {
            let artifact = &normalized["artifact"];
            let name = artifact.get("name").and_then(Value::as_str).unwrap_or("artifact");
            let format = artifact.get("format").and_then(Value::as_str).unwrap_or("md");
            let content = artifact.get("content").and_then(Value::as_str).unwrap_or("");
            let created = create_and_activate_artifact(
                pool,
                &ctx.workspace.artifacts_dir(),
                plan_id,
                task_id,
                name,
                format,
                content,
                ctx.config.guardrails.max_artifact_versions_per_task,
            )
            .await;
            match created {
                Ok(artifact_id) => {
                    info!(task_id, artifact_id = %artifact_id, "executor produced artifact");
                    set_status(pool, plan_id, task_id, TaskStatus::ReadyToCheck, None).await?;
                }
                Err(e) if e.downcast_ref::<ArtifactCapExceeded>().is_some() => {
                    handle_error(
                        pool,
                        plan_id,
                        Some(task_id),
                        ErrorCode::MaxAttemptsExceeded,
                        &format!("{e:#}"),
                        json!({"budget": "max_artifact_versions_per_task"}),
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
        "NEEDS_INPUT" => {
            let required_docs: Vec<Value> = normalized["needs_input"]["required_docs"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            write_required_docs(&ctx.workspace.required_docs_dir(), task_id, &required_docs).await?;
            // No attempt increment: waiting on the user is not a failure.
            handle_error(
                pool,
                plan_id,
                Some(task_id),
                ErrorCode::InputMissing,
                "Missing required input(s).",
                json!({"required_docs": required_docs}),
            )
            .await?;
        }
        "NOOP" => {
            // No state change: hand the task back in the status it was
            // scheduled from.
            set_status(pool, plan_id, task_id, prior_status, None).await?;
        }
        "ERROR" => {
            let code_str = normalized["error"]["code"].as_str().unwrap_or("");
            let message = normalized["error"]["message"].as_str().unwrap_or("model reported ERROR");
            let code = match code_str {
                "LLM_REFUSAL" => ErrorCode::LlmRefusal,
                "SKILL_BAD_INPUT" | "INPUT_MISSING" => ErrorCode::InputMissing,
                _ => ErrorCode::LlmFailed,
            };
            handle_error(
                pool,
                plan_id,
                Some(task_id),
                code,
                &format!("model_error[{}]: {}", code_str, message),
                json!({"llm_call_id": exchange.llm_call_id}),
            )
            .await?;
            escalate_if_exhausted(ctx, plan_id, task_id).await?;
        }
        other => {
            handle_error(
                pool,
                plan_id,
                Some(task_id),
                ErrorCode::LlmUnparseable,
                &format!("unknown result_type: {}", other),
                json!({"llm_call_id": exchange.llm_call_id}),
            )
            .await?;
            escalate_if_exhausted(ctx, plan_id, task_id).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, req: &str) -> EvidenceFile {
        EvidenceFile {
            path: path.to_string(),
            sha256: format!("sha-{}", path),
            requirement_name: req.to_string(),
        }
    }

    #[test]
    fn test_final_marker_wins_selection() {
        let tmp = tempfile::tempdir().unwrap();
        let draft = tmp.path().join("spec_draft.md");
        let fin = tmp.path().join("spec_FINAL.md");
        std::fs::write(&draft, "draft").unwrap();
        std::fs::write(&fin, "final").unwrap();

        let files = vec![
            file(draft.to_str().unwrap(), "product_spec"),
            file(fin.to_str().unwrap(), "product_spec"),
        ];
        let (selected, conflicts) = select_best_inputs(&files);
        assert_eq!(selected.len(), 1);
        assert!(selected[0].path.to_lowercase().contains("final"));
        // A FINAL-marked winner is not a conflict.
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_two_drafts_is_a_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = tmp.path().join("spec_v1.md");
        let v2 = tmp.path().join("spec_v2.md");
        std::fs::write(&v1, "one").unwrap();
        std::fs::write(&v2, "two").unwrap();

        let files = vec![
            file(v1.to_str().unwrap(), "product_spec"),
            file(v2.to_str().unwrap(), "product_spec"),
        ];
        let (selected, conflicts) = select_best_inputs(&files);
        assert_eq!(selected.len(), 1);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0]["requirement_name"], "product_spec");
    }

    #[tokio::test]
    async fn test_required_docs_file_lists_requirements() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = vec![json!({
            "name": "product_spec",
            "description": "the product requirements document",
            "accepted_types": ["md", "txt"],
            "suggested_path": "inputs/product_spec/spec.md",
        })];
        let path = write_required_docs(tmp.path(), "task-1", &docs).await.unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("product_spec"));
        assert!(body.contains("suggested_path: inputs/product_spec/spec.md"));
        assert!(body.contains("accepted_types: md, txt"));
    }
}
