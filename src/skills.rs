//! Skill seam: bounded external tool invocations with idempotent runs.
//!
//! A skill turns input files into text or artifacts for the executor's
//! prompt. Every invocation is recorded in `skill_runs` keyed by
//! `skill_name ⊕ sorted(input_hashes) ⊕ params`, so replaying a tick never
//! re-runs completed work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::util::{new_uuid, sha256_text, safe_read_text, utc_now_iso};

pub const SKILL_TEXT_EXTRACT: &str = "text_extract";

#[derive(Debug, Clone)]
pub struct SkillInput {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct SkillOutput {
    /// Extracted text snippets, one per input, prompt-ready.
    pub texts: Vec<String>,
}

#[derive(Debug)]
pub struct SkillFailure {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for SkillFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SkillFailure {}

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, inputs: &[SkillInput], params: &Value) -> anyhow::Result<SkillOutput>;
}

/// Built-in extraction for the plain-text artifact formats. Binary formats
/// (PDF, DOCX) are plug-in territory and are not shipped here.
pub struct TextExtractSkill;

#[async_trait]
impl Skill for TextExtractSkill {
    fn name(&self) -> &'static str {
        SKILL_TEXT_EXTRACT
    }

    async fn run(&self, inputs: &[SkillInput], params: &Value) -> anyhow::Result<SkillOutput> {
        let max_chars = params
            .get("max_chars")
            .and_then(Value::as_u64)
            .unwrap_or(50_000) as usize;

        let mut texts = Vec::with_capacity(inputs.len());
        for input in inputs {
            if !input.path.exists() {
                return Err(anyhow::anyhow!(SkillFailure {
                    code: "SKILL_BAD_INPUT",
                    message: format!("input file missing: {}", input.path.display()),
                }));
            }
            let text = safe_read_text(&input.path, max_chars).await.map_err(|e| {
                anyhow::anyhow!(SkillFailure {
                    code: "SKILL_FAILED",
                    message: format!("read failed for {}: {}", input.path.display(), e),
                })
            })?;
            texts.push(text);
        }
        Ok(SkillOutput { texts })
    }
}

pub type SkillRegistry = HashMap<&'static str, Arc<dyn Skill>>;

pub fn builtin_registry() -> SkillRegistry {
    let mut registry: SkillRegistry = HashMap::new();
    registry.insert(SKILL_TEXT_EXTRACT, Arc::new(TextExtractSkill));
    registry
}

pub fn idempotency_key(skill_name: &str, inputs: &[SkillInput], params: &Value) -> String {
    let mut hashes: Vec<&str> = inputs.iter().map(|i| i.sha256.as_str()).collect();
    hashes.sort_unstable();
    let material = format!(
        "{}\n{}\n{}",
        skill_name,
        hashes.join("\n"),
        crate::util::canonical_json(params)
    );
    sha256_text(&material)
}

/// Run a skill with the configured budget, recording the run. A repeat
/// invocation with the same idempotency key returns the recorded outputs
/// without executing again.
pub async fn run_skill(
    pool: &SqlitePool,
    registry: &SkillRegistry,
    plan_id: &str,
    task_id: &str,
    skill_name: &str,
    inputs: Vec<SkillInput>,
    params: Value,
    timeout: Duration,
) -> anyhow::Result<SkillOutput> {
    let skill = registry.get(skill_name).ok_or_else(|| {
        anyhow::anyhow!(SkillFailure {
            code: "SKILL_BAD_INPUT",
            message: format!("unknown skill: {}", skill_name),
        })
    })?;

    let key = idempotency_key(skill_name, &inputs, &params);
    let cached = sqlx::query(
        "SELECT status, outputs_json FROM skill_runs WHERE idempotency_key = ?",
    )
    .bind(&key)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = cached {
        let status: String = row.get("status");
        if status == "SUCCEEDED" {
            let outputs_json: String = row.get("outputs_json");
            let texts: Vec<String> = serde_json::from_str(&outputs_json).unwrap_or_default();
            debug!(skill_name, task_id, "skill run served from idempotency cache");
            return Ok(SkillOutput { texts });
        }
    }

    let skill_run_id = new_uuid();
    let inputs_json = json!(inputs
        .iter()
        .map(|i| json!({"path": i.path.to_string_lossy(), "sha256": i.sha256}))
        .collect::<Vec<_>>());
    sqlx::query(
        "INSERT INTO skill_runs(
            skill_run_id, plan_id, task_id, skill_name, inputs_json, params_json,
            idempotency_key, status, started_at
        ) VALUES(?, ?, ?, ?, ?, ?, ?, 'RUNNING', ?)
        ON CONFLICT(idempotency_key) DO UPDATE SET
          status = 'RUNNING',
          started_at = excluded.started_at,
          finished_at = NULL,
          error_json = NULL",
    )
    .bind(&skill_run_id)
    .bind(plan_id)
    .bind(task_id)
    .bind(skill_name)
    .bind(inputs_json.to_string())
    .bind(params.to_string())
    .bind(&key)
    .bind(utc_now_iso())
    .execute(pool)
    .await?;

    let outcome = tokio::time::timeout(timeout, skill.run(&inputs, &params)).await;
    let (status, outputs, error): (&str, Vec<String>, Option<Value>) = match outcome {
        Err(_) => (
            "FAILED",
            Vec::new(),
            Some(json!({
                "code": "SKILL_TIMEOUT",
                "message": format!("skill exceeded {}s", timeout.as_secs()),
            })),
        ),
        Ok(Err(e)) => {
            let code = e
                .downcast_ref::<SkillFailure>()
                .map(|f| f.code)
                .unwrap_or("SKILL_FAILED");
            (
                "FAILED",
                Vec::new(),
                Some(json!({"code": code, "message": format!("{e:#}")})),
            )
        }
        Ok(Ok(output)) => ("SUCCEEDED", output.texts, None),
    };

    sqlx::query(
        "UPDATE skill_runs SET status = ?, outputs_json = ?, error_json = ?, finished_at = ?
         WHERE idempotency_key = ?",
    )
    .bind(status)
    .bind(json!(outputs).to_string())
    .bind(error.as_ref().map(|e| e.to_string()))
    .bind(utc_now_iso())
    .bind(&key)
    .execute(pool)
    .await?;

    match error {
        None => Ok(SkillOutput { texts: outputs }),
        Some(error) => {
            let code: &'static str = match error.get("code").and_then(Value::as_str) {
                Some("SKILL_TIMEOUT") => "SKILL_TIMEOUT",
                Some("SKILL_BAD_INPUT") => "SKILL_BAD_INPUT",
                _ => "SKILL_FAILED",
            };
            Err(anyhow::anyhow!(SkillFailure {
                code,
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("skill failed")
                    .to_string(),
            }))
        }
    }
}
