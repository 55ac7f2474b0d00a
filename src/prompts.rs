//! Prompt assembly: `[Shared] + [Agent-specific] + [RuntimeContext]`.
//!
//! Prompt texts are versioned and content-hashed; every telemetry row
//! records which versions produced it so a transcript can be replayed
//! against the exact wording that was live.

use serde_json::Value;
use sqlx::SqlitePool;

use crate::model::{AGENT_EXECUTOR, AGENT_REVIEWER};
use crate::util::{sha256_text, utc_now_iso};

const SHARED_PROMPT: &str = "\
You are part of a two-agent delivery team working on a decomposed task plan.
Rules that apply to every response:
- Respond with a single JSON object and nothing else. No prose, no fences.
- Never invent file contents you were not given; ask via NEEDS_INPUT instead.
- Keep every string field in the language of the task description.
";

const EXECUTOR_PROMPT: &str = "\
You are the executor. Given one task, produce its deliverable.
Respond with `xiaobo_action_v1` JSON:
{
  \"schema_version\": \"xiaobo_action_v1\",
  \"task_id\": \"<the task id>\",
  \"result_type\": \"ARTIFACT\" | \"NEEDS_INPUT\" | \"NOOP\" | \"ERROR\",
  \"artifact\": {\"name\": \"...\", \"format\": \"md|txt|json|html|css|js\", \"content\": \"...\"},
  \"needs_input\": {\"required_docs\": [{\"name\": \"...\", \"description\": \"...\", \"accepted_types\": [], \"suggested_path\": \"...\"}]},
  \"error\": {\"code\": \"...\", \"message\": \"...\"}
}
Only include the sub-object matching your result_type. Use NEEDS_INPUT when a
required document is missing rather than guessing at its contents.
";

const REVIEWER_PROMPT: &str = "\
You are the reviewer. Score the submitted work against its acceptance
criteria. Respond with `xiaojing_review_v1` JSON:
{
  \"schema_version\": \"xiaojing_review_v1\",
  \"task_id\": \"<the reviewed id>\",
  \"review_target\": \"PLAN\" | \"NODE\",
  \"total_score\": 0-100,
  \"action_required\": \"APPROVE\" | \"MODIFY\" | \"REQUEST_EXTERNAL_INPUT\",
  \"summary\": \"...\",
  \"breakdown\": [{\"dimension\": \"...\", \"score\": 0-100, \"max_score\": 100, \"issues\": []}],
  \"suggestions\": [{\"priority\": \"HIGH|MED|LOW\", \"change\": \"...\", \"steps\": [], \"acceptance_criteria\": \"...\"}]
}
APPROVE only work that genuinely meets the bar; concrete suggestions beat
vague ones.
";

const PLANNER_PROMPT: &str = "\
You are the planner. Decompose the top task into a `plan_json_v1` document:
{
  \"schema_version\": \"plan_json_v1\",
  \"plan\": {\"plan_id\": \"<uuid>\", \"title\": \"...\", \"owner_agent_id\": \"xiaobo\",
            \"root_task_id\": \"<uuid>\", \"created_at\": \"<iso8601>\", \"constraints\": {}},
  \"nodes\": [{\"task_id\": \"<uuid>\", \"plan_id\": \"<uuid>\", \"node_type\": \"GOAL|ACTION|CHECK\",
              \"title\": \"...\", \"owner_agent_id\": \"xiaobo\", \"priority\": 0, \"tags\": []}],
  \"edges\": [{\"edge_id\": \"<uuid>\", \"plan_id\": \"<uuid>\", \"from_task_id\": \"<uuid>\",
              \"to_task_id\": \"<uuid>\", \"edge_type\": \"DECOMPOSE|DEPENDS_ON|ALTERNATIVE\",
              \"metadata\": {\"and_or\": \"AND\"}}],
  \"requirements\": [{\"requirement_id\": \"<uuid>\", \"task_id\": \"<uuid>\", \"name\": \"...\",
                     \"kind\": \"FILE|CONFIRMATION|SKILL_OUTPUT\", \"required\": 1, \"min_count\": 1,
                     \"allowed_types\": [], \"source\": \"USER|AGENT|ANY\"}]
}
The root node is the GOAL; every other node hangs off it via DECOMPOSE edges.
Declare an input requirement for every document the work cannot proceed
without. Keep the plan as small as the task allows.
";

#[derive(Debug, Clone)]
pub struct PromptSlot {
    pub kind: &'static str,
    pub agent: &'static str,
    pub version: String,
    pub sha256: String,
    pub text: &'static str,
}

#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub shared: PromptSlot,
    pub planner: PromptSlot,
    pub executor: PromptSlot,
    pub reviewer: PromptSlot,
}

impl PromptBundle {
    pub fn builtin() -> Self {
        let slot = |kind: &'static str, agent: &'static str, text: &'static str| PromptSlot {
            kind,
            agent,
            version: "v1".to_string(),
            sha256: sha256_text(text),
            text,
        };
        Self {
            shared: slot("shared", "-", SHARED_PROMPT),
            planner: slot("planner", AGENT_EXECUTOR, PLANNER_PROMPT),
            executor: slot("executor", AGENT_EXECUTOR, EXECUTOR_PROMPT),
            reviewer: slot("reviewer", AGENT_REVIEWER, REVIEWER_PROMPT),
        }
    }

    /// Register each slot (idempotent on kind/agent/version).
    pub async fn register(&self, pool: &SqlitePool) -> anyhow::Result<()> {
        for slot in [&self.shared, &self.planner, &self.executor, &self.reviewer] {
            sqlx::query(
                "INSERT OR IGNORE INTO prompts(kind, agent, version, sha256, text, registered_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
            )
            .bind(slot.kind)
            .bind(slot.agent)
            .bind(&slot.version)
            .bind(&slot.sha256)
            .bind(slot.text)
            .bind(utc_now_iso())
            .execute(pool)
            .await?;
        }
        Ok(())
    }
}

pub fn build_plan_prompt(
    bundle: &PromptBundle,
    top_task: &str,
    constraints: &Value,
    skills: &[String],
    retry_notes: &str,
) -> String {
    let mut prompt = format!("{}\n{}\n", bundle.shared.text, bundle.planner.text);
    prompt.push_str("## Top task\n");
    prompt.push_str(top_task);
    prompt.push('\n');
    prompt.push_str(&format!("\n## Constraints\n{}\n", constraints));
    if !skills.is_empty() {
        prompt.push_str(&format!("\n## Available skills\n{}\n", skills.join(", ")));
    }
    if !retry_notes.is_empty() {
        prompt.push_str(&format!(
            "\n## Notes from the previous attempt (must address)\n{}\n",
            retry_notes
        ));
    }
    prompt
}

pub struct ActionContext<'a> {
    pub task_id: &'a str,
    pub title: &'a str,
    pub goal_statement: Option<&'a str>,
    pub deliverable_spec: Option<&'a Value>,
    pub acceptance_criteria: Option<&'a Value>,
    pub evidence_snippets: &'a [String],
    pub upstream_artifacts: &'a [String],
    pub suggestions_text: &'a str,
}

pub fn build_action_prompt(bundle: &PromptBundle, ctx: &ActionContext<'_>) -> String {
    let mut prompt = format!("{}\n{}\n", bundle.shared.text, bundle.executor.text);
    prompt.push_str(&format!("## Task\nid: {}\ntitle: {}\n", ctx.task_id, ctx.title));
    if let Some(goal) = ctx.goal_statement {
        prompt.push_str(&format!("goal: {}\n", goal));
    }
    if let Some(spec) = ctx.deliverable_spec {
        prompt.push_str(&format!("\n## Deliverable spec\n{}\n", spec));
    }
    if let Some(criteria) = ctx.acceptance_criteria {
        prompt.push_str(&format!("\n## Acceptance criteria\n{}\n", criteria));
    }
    if !ctx.evidence_snippets.is_empty() {
        prompt.push_str("\n## Provided inputs\n");
        for (i, snippet) in ctx.evidence_snippets.iter().enumerate() {
            prompt.push_str(&format!("### Input {}\n{}\n", i + 1, snippet));
        }
    }
    if !ctx.upstream_artifacts.is_empty() {
        prompt.push_str("\n## Approved upstream deliverables\n");
        for (i, artifact) in ctx.upstream_artifacts.iter().enumerate() {
            prompt.push_str(&format!("### Upstream {}\n{}\n", i + 1, artifact));
        }
    }
    if !ctx.suggestions_text.is_empty() {
        prompt.push_str(&format!(
            "\n## Reviewer suggestions from the previous round (must address)\n{}\n",
            ctx.suggestions_text
        ));
    }
    prompt
}

pub struct ReviewContext<'a> {
    pub task_id: &'a str,
    pub title: &'a str,
    pub review_target: &'a str,
    pub acceptance_criteria: Option<&'a Value>,
    pub artifact_name: &'a str,
    pub artifact_text: &'a str,
}

pub fn build_review_prompt(bundle: &PromptBundle, ctx: &ReviewContext<'_>) -> String {
    let mut prompt = format!("{}\n{}\n", bundle.shared.text, bundle.reviewer.text);
    prompt.push_str(&format!(
        "## Review target\nid: {}\ntitle: {}\nreview_target: {}\n",
        ctx.task_id, ctx.title, ctx.review_target
    ));
    if let Some(criteria) = ctx.acceptance_criteria {
        prompt.push_str(&format!("\n## Acceptance criteria\n{}\n", criteria));
    }
    prompt.push_str(&format!(
        "\n## Submitted work ({})\n{}\n",
        ctx.artifact_name, ctx.artifact_text
    ));
    prompt
}

pub fn build_plan_review_prompt(bundle: &PromptBundle, plan_id: &str, plan_json: &Value) -> String {
    let mut prompt = format!("{}\n{}\n", bundle.shared.text, bundle.reviewer.text);
    prompt.push_str(&format!(
        "## Review target\nid: {}\nreview_target: PLAN\n",
        plan_id
    ));
    prompt.push_str(
        "\nJudge the plan for completeness, ordering, and whether each ACTION \
         has a reviewable deliverable.\n",
    );
    prompt.push_str(&format!(
        "\n## Plan under review\n{}\n",
        serde_json::to_string_pretty(plan_json).unwrap_or_else(|_| plan_json.to_string())
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bundle_hashes_are_stable() {
        let a = PromptBundle::builtin();
        let b = PromptBundle::builtin();
        assert_eq!(a.shared.sha256, b.shared.sha256);
        assert_eq!(a.executor.sha256, b.executor.sha256);
        assert_ne!(a.executor.sha256, a.reviewer.sha256);
    }

    #[test]
    fn test_action_prompt_sections() {
        let bundle = PromptBundle::builtin();
        let evidence = vec!["# spec\ncontent".to_string()];
        let upstream = vec!["previous deliverable".to_string()];
        let prompt = build_action_prompt(
            &bundle,
            &ActionContext {
                task_id: "t1",
                title: "Write the game",
                goal_statement: Some("single file index.html"),
                deliverable_spec: None,
                acceptance_criteria: None,
                evidence_snippets: &evidence,
                upstream_artifacts: &upstream,
                suggestions_text: "add game-over screen",
            },
        );
        assert!(prompt.contains("Write the game"));
        assert!(prompt.contains("## Provided inputs"));
        assert!(prompt.contains("## Approved upstream deliverables"));
        assert!(prompt.contains("add game-over screen"));
        // Shared rules always lead.
        assert!(prompt.starts_with(SHARED_PROMPT));
    }

    #[test]
    fn test_plan_prompt_includes_retry_notes() {
        let bundle = PromptBundle::builtin();
        let with_notes = build_plan_prompt(&bundle, "Build a thing", &json!({}), &[], "fix edges");
        assert!(with_notes.contains("must address"));
        let without = build_plan_prompt(&bundle, "Build a thing", &json!({}), &[], "");
        assert!(!without.contains("must address"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let bundle = PromptBundle::builtin();
        bundle.register(store.pool()).await.unwrap();
        bundle.register(store.pool()).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM prompts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 4);
    }
}
