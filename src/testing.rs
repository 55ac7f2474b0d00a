//! Test infrastructure: ScriptedProvider and the engine harness.
//!
//! Provides a fully wired EngineContext with a scripted LM and an in-memory
//! store, suitable for integration tests that exercise the real loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::{RuntimeConfig, Workspace};
use crate::context::EngineContext;
use crate::llm::LmProvider;

/// LM provider that returns scripted responses in FIFO order and records
/// every prompt it was sent.
pub struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub async fn prompt_log(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl LmProvider for ScriptedProvider {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.lock().await.push(prompt.to_string());
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            Ok(r#"{"result_type": "NOOP"}"#.to_string())
        } else {
            Ok(responses.remove(0))
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted response builders
// ---------------------------------------------------------------------------

pub fn artifact_response(name: &str, format: &str, content: &str) -> String {
    json!({
        "schema_version": "xiaobo_action_v1",
        "result_type": "ARTIFACT",
        "artifact": {"name": name, "format": format, "content": content},
    })
    .to_string()
}

pub fn needs_input_response(doc_name: &str, description: &str) -> String {
    json!({
        "schema_version": "xiaobo_action_v1",
        "result_type": "NEEDS_INPUT",
        "needs_input": {"required_docs": [{
            "name": doc_name,
            "description": description,
            "accepted_types": ["md"],
            "suggested_path": format!("inputs/{}/", doc_name),
        }]},
    })
    .to_string()
}

pub fn review_response(score: i64, action: &str, suggestions: &[(&str, &str)]) -> String {
    json!({
        "schema_version": "xiaojing_review_v1",
        "review_target": "NODE",
        "total_score": score,
        "action_required": action,
        "summary": "scripted verdict",
        "breakdown": [{"dimension": "overall", "score": score, "max_score": 100, "issues": []}],
        "suggestions": suggestions.iter().map(|(priority, change)| json!({
            "priority": priority,
            "change": change,
            "steps": [],
            "acceptance_criteria": "resolved",
        })).collect::<Vec<_>>(),
    })
    .to_string()
}

pub fn plan_review_response(score: i64, action: &str) -> String {
    json!({
        "schema_version": "xiaojing_review_v1",
        "review_target": "PLAN",
        "total_score": score,
        "action_required": action,
        "summary": "scripted plan verdict",
        "breakdown": [{"dimension": "overall", "score": score, "max_score": 100, "issues": []}],
        "suggestions": [],
    })
    .to_string()
}

/// A one-ACTION generated plan, with optional input requirements on the
/// action as `(name, min_count)` pairs.
pub fn plan_response(title: &str, requirements: &[(&str, i64)]) -> String {
    json!({
        "schema_version": "plan_json_v1",
        "plan": {"title": title},
        "nodes": [
            {"id": "root", "type": "GOAL", "title": title},
            {"id": "work", "type": "ACTION", "title": format!("Deliver: {}", title), "priority": 5},
        ],
        "edges": [
            {"from": "root", "to": "work", "type": "DECOMPOSE", "metadata": {"and_or": "AND"}},
        ],
        "requirements": requirements.iter().map(|(name, min_count)| json!({
            "task_id": "work",
            "name": name,
            "kind": "FILE",
            "required": 1,
            "min_count": min_count,
            "allowed_types": ["md"],
            "source": "USER",
        })).collect::<Vec<_>>(),
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub ctx: EngineContext,
    pub provider: Arc<ScriptedProvider>,
    // Held so the workspace outlives the test body.
    _workspace_dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn with_responses(responses: Vec<String>) -> Self {
        Self::with_config_and_responses(RuntimeConfig::default(), responses).await
    }

    pub async fn with_config_and_responses(
        mut config: RuntimeConfig,
        responses: Vec<String>,
    ) -> Self {
        // Keep test loops snappy.
        config.poll_interval_seconds = 0;
        let workspace_dir = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(workspace_dir.path());
        let provider = Arc::new(ScriptedProvider::with_responses(responses));
        let ctx = EngineContext::in_memory(workspace, config, provider.clone())
            .await
            .expect("harness context");
        Self {
            ctx,
            provider,
            _workspace_dir: workspace_dir,
        }
    }

    pub async fn task_by_title(&self, plan_id: &str, title_prefix: &str) -> crate::model::TaskNode {
        let tasks = self.ctx.store.tasks_for_plan(plan_id).await.unwrap();
        tasks
            .into_iter()
            .find(|t| t.title.starts_with(title_prefix))
            .expect("task by title")
    }
}
