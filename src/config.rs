//! Runtime configuration.
//!
//! A single JSON file configures the engine; environment variables are
//! deliberately not consulted so a run is fully reproducible from the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default = "default_workflow_mode")]
    pub workflow_mode: String,
    #[serde(default = "default_max_decomposition_depth")]
    pub max_decomposition_depth: u32,
    #[serde(default = "default_one_shot_threshold")]
    pub one_shot_threshold_person_days: f64,
    #[serde(default = "default_pass_score")]
    pub plan_review_pass_score: i64,
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: i64,
    #[serde(default = "default_max_plan_attempts")]
    pub max_plan_attempts: u32,
    #[serde(default = "default_max_review_attempts")]
    pub max_review_attempts: u32,
    #[serde(default = "default_max_plan_runtime_seconds")]
    pub max_plan_runtime_seconds: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_skill_timeout_seconds")]
    pub skill_timeout_seconds: u64,
    #[serde(default = "default_max_skill_retries")]
    pub max_skill_retries: i64,
    #[serde(default)]
    pub failed_auto_reset_ready: bool,
    #[serde(default)]
    pub export_include_candidates: bool,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            timeout_s: default_llm_timeout_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailsConfig {
    #[serde(default = "default_max_run_iterations")]
    pub max_run_iterations: u64,
    #[serde(default = "default_max_llm_calls_per_run")]
    pub max_llm_calls_per_run: u64,
    #[serde(default = "default_max_llm_calls_per_task")]
    pub max_llm_calls_per_task: i64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_max_response_chars")]
    pub max_response_chars: usize,
    #[serde(default = "default_max_task_events_per_task")]
    pub max_task_events_per_task: u64,
    #[serde(default = "default_max_llm_calls_rows")]
    pub max_llm_calls_rows: u64,
    #[serde(default = "default_max_task_events_rows")]
    pub max_task_events_rows: u64,
    #[serde(default = "default_max_artifact_versions")]
    pub max_artifact_versions_per_task: u64,
    #[serde(default = "default_max_review_versions")]
    pub max_review_versions_per_check: u64,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_run_iterations: default_max_run_iterations(),
            max_llm_calls_per_run: default_max_llm_calls_per_run(),
            max_llm_calls_per_task: default_max_llm_calls_per_task(),
            max_prompt_chars: default_max_prompt_chars(),
            max_response_chars: default_max_response_chars(),
            max_task_events_per_task: default_max_task_events_per_task(),
            max_llm_calls_rows: default_max_llm_calls_rows(),
            max_task_events_rows: default_max_task_events_rows(),
            max_artifact_versions_per_task: default_max_artifact_versions(),
            max_review_versions_per_check: default_max_review_versions(),
        }
    }
}

fn default_workflow_mode() -> String {
    "v1".to_string()
}
fn default_max_decomposition_depth() -> u32 {
    5
}
fn default_one_shot_threshold() -> f64 {
    10.0
}
fn default_pass_score() -> i64 {
    90
}
fn default_max_task_attempts() -> i64 {
    3
}
fn default_max_plan_attempts() -> u32 {
    3
}
fn default_max_review_attempts() -> u32 {
    3
}
fn default_max_plan_runtime_seconds() -> u64 {
    2 * 60 * 60
}
fn default_poll_interval_seconds() -> u64 {
    3
}
fn default_skill_timeout_seconds() -> u64 {
    120
}
fn default_max_skill_retries() -> i64 {
    3
}
fn default_llm_base_url() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}
fn default_llm_model() -> String {
    "local-model".to_string()
}
fn default_llm_timeout_s() -> u64 {
    300
}
fn default_max_run_iterations() -> u64 {
    200
}
fn default_max_llm_calls_per_run() -> u64 {
    50
}
fn default_max_llm_calls_per_task() -> i64 {
    10
}
fn default_max_prompt_chars() -> usize {
    120_000
}
fn default_max_response_chars() -> usize {
    200_000
}
fn default_max_task_events_per_task() -> u64 {
    200
}
fn default_max_llm_calls_rows() -> u64 {
    5_000
}
fn default_max_task_events_rows() -> u64 {
    20_000
}
fn default_max_artifact_versions() -> u64 {
    50
}
fn default_max_review_versions() -> u64 {
    50
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Deserializing an empty object applies every serde field default.
        serde_json::from_str("{}").expect("default config must deserialize")
    }
}

impl RuntimeConfig {
    /// Load from a JSON file; a missing file yields the defaults so a fresh
    /// checkout runs without ceremony.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid JSON in {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.workflow_mode != "v1" && self.workflow_mode != "v2" {
            anyhow::bail!("workflow_mode must be v1|v2 (got {:?})", self.workflow_mode);
        }
        if self.plan_review_pass_score <= 0 || self.plan_review_pass_score > 100 {
            anyhow::bail!("plan_review_pass_score must be 1..100");
        }
        if self.max_task_attempts <= 0 {
            anyhow::bail!("max_task_attempts must be > 0");
        }
        if self.max_decomposition_depth == 0 {
            anyhow::bail!("max_decomposition_depth must be > 0");
        }
        if self.one_shot_threshold_person_days <= 0.0 {
            anyhow::bail!("one_shot_threshold_person_days must be > 0");
        }
        if self.llm.timeout_s == 0 {
            anyhow::bail!("llm.timeout_s must be > 0");
        }
        if self.guardrails.max_run_iterations == 0
            || self.guardrails.max_llm_calls_per_run == 0
            || self.guardrails.max_llm_calls_per_task <= 0
            || self.guardrails.max_prompt_chars == 0
            || self.guardrails.max_response_chars == 0
        {
            anyhow::bail!("guardrails limits must all be > 0");
        }
        Ok(())
    }
}

/// Filesystem layout rooted at the engine's working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("state").join("tandem.db")
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join("tasks").join("plan.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("tandem.json")
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.root.join("workspace").join("inputs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("workspace").join("artifacts")
    }

    pub fn reviews_dir(&self) -> PathBuf {
        self.root.join("workspace").join("reviews")
    }

    pub fn required_docs_dir(&self) -> PathBuf {
        self.root.join("workspace").join("required_docs")
    }

    pub fn deliverables_dir(&self) -> PathBuf {
        self.root.join("workspace").join("deliverables")
    }

    pub async fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            self.root.join("state"),
            self.root.join("tasks"),
            self.inputs_dir(),
            self.artifacts_dir(),
            self.reviews_dir(),
            self.required_docs_dir(),
            self.deliverables_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}
