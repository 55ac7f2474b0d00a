//! End-to-end scenarios driving the real loop with a scripted LM.

use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::engine::{run_plan, RunOutcome};
use crate::guardrails::FuseTrip;
use crate::matcher::scan_inputs_and_bind_evidence;
use crate::model::TaskStatus;
use crate::plan_workflow::generate_and_review_plan;
use crate::readiness::recompute_readiness_for_plan;
use crate::testing::{
    artifact_response, plan_response, plan_review_response, review_response, TestHarness,
};

async fn create_plan(harness: &TestHarness, top_task: &str) -> String {
    generate_and_review_plan(&harness.ctx, top_task, None)
        .await
        .expect("plan approved")
        .plan_id
}

#[tokio::test]
async fn test_happy_path_single_action_to_done() {
    let harness = TestHarness::with_responses(vec![
        plan_response("create a 2048 game (single file index.html)", &[]),
        plan_review_response(95, "APPROVE"),
        artifact_response("index", "html", "<html><body>2048</body></html>"),
        review_response(95, "APPROVE", &[]),
    ])
    .await;

    let plan_id = create_plan(&harness, "create a 2048 game (single file index.html)").await;
    let outcome = run_plan(&harness.ctx, &plan_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::PlanDone);

    // The ACTION is DONE with its artifact approved.
    let action = harness.task_by_title(&plan_id, "Deliver:").await;
    assert_eq!(action.status, TaskStatus::Done);
    let approved = action.approved_artifact_id.expect("approved artifact");
    assert_eq!(action.active_artifact_id.as_deref(), Some(approved.as_str()));

    // Exactly one review row, approving that artifact.
    let (count, reviewed, action_required): (i64, String, String) = sqlx::query_as(
        "SELECT COUNT(1), MAX(reviewed_artifact_id), MAX(action_required) FROM reviews",
    )
    .fetch_one(harness.ctx.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(reviewed, approved);
    assert_eq!(action_required, "APPROVE");

    // Root GOAL aggregated to DONE.
    assert!(harness.ctx.store.is_plan_done(&plan_id).await.unwrap());

    // The artifact file is on disk under artifacts/<task>/<artifact>/.
    let artifact = crate::artifacts::load_artifact(harness.ctx.pool(), &approved)
        .await
        .unwrap()
        .unwrap();
    assert!(std::path::Path::new(&artifact.path).exists());
    assert!(artifact.path.ends_with("index.html"));
}

#[tokio::test]
async fn test_needs_input_blocks_then_ready_after_file_drop() {
    let harness = TestHarness::with_responses(vec![
        plan_response("summarize the product spec", &[("product_spec", 1)]),
        plan_review_response(92, "APPROVE"),
    ])
    .await;

    let plan_id = create_plan(&harness, "summarize the product spec").await;
    let outcome = run_plan(&harness.ctx, &plan_id).await.unwrap();
    let RunOutcome::BlockedWaitingUser(summary) = outcome else {
        panic!("expected blocked outcome, got {:?}", outcome);
    };
    assert!(summary.exists());

    let action = harness.task_by_title(&plan_id, "Deliver:").await;
    assert_eq!(action.status, TaskStatus::Blocked);
    assert_eq!(
        action.blocked_reason,
        Some(crate::model::BlockedReason::WaitingInput)
    );
    // No artifact was produced and no executor call was spent.
    assert!(action.active_artifact_id.is_none());

    // The required-docs note names the requirement.
    let docs_path = harness
        .ctx
        .workspace
        .required_docs_dir()
        .join(format!("{}.md", action.task_id));
    let docs = std::fs::read_to_string(&docs_path).unwrap();
    assert!(docs.contains("product_spec"));

    // Drop the file where the note says; the next sweep unblocks the task.
    let spec_dir = harness.ctx.workspace.inputs_dir().join("product_spec");
    std::fs::create_dir_all(&spec_dir).unwrap();
    std::fs::write(spec_dir.join("spec.md"), "# the spec").unwrap();

    scan_inputs_and_bind_evidence(harness.ctx.pool(), &plan_id, &harness.ctx.workspace.inputs_dir())
        .await
        .unwrap();
    recompute_readiness_for_plan(harness.ctx.pool(), &plan_id).await.unwrap();

    let action = harness.task_by_title(&plan_id, "Deliver:").await;
    assert_eq!(action.status, TaskStatus::Ready);
}

#[tokio::test]
async fn test_reject_then_approve_keeps_both_artifacts() {
    let harness = TestHarness::with_responses(vec![
        plan_response("create a 2048 game", &[]),
        plan_review_response(95, "APPROVE"),
        artifact_response("index", "html", "<html>v1</html>"),
        review_response(70, "MODIFY", &[("HIGH", "add game-over screen")]),
        artifact_response("index", "html", "<html>v2 with game-over</html>"),
        review_response(98, "APPROVE", &[]),
    ])
    .await;

    let plan_id = create_plan(&harness, "create a 2048 game").await;
    let outcome = run_plan(&harness.ctx, &plan_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::PlanDone);

    let action = harness.task_by_title(&plan_id, "Deliver:").await;
    assert_eq!(action.status, TaskStatus::Done);
    assert_eq!(action.attempt_count, 1);

    // Two artifact versions retained; the approved one is the second.
    let artifacts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT artifact_id, version FROM artifacts WHERE task_id = ? ORDER BY version",
    )
    .bind(&action.task_id)
    .fetch_all(harness.ctx.pool())
    .await
    .unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(
        action.approved_artifact_id.as_deref(),
        Some(artifacts[1].0.as_str())
    );

    // The rework prompt carried the reviewer's suggestion.
    let prompts = harness.provider.prompt_log().await;
    assert!(prompts.iter().any(|p| p.contains("add game-over screen")));
}

#[tokio::test]
async fn test_review_race_approves_old_version_without_done() {
    // The loop itself is single-writer, so the race is driven directly: a
    // newer artifact appears after the review pins its version.
    let harness = TestHarness::with_responses(vec![
        plan_response("race", &[]),
        plan_review_response(95, "APPROVE"),
        artifact_response("out", "md", "v1"),
        review_response(95, "APPROVE", &[]),
    ])
    .await;
    let plan_id = create_plan(&harness, "race").await;

    // Tick once manually: executor produces v1.
    recompute_readiness_for_plan(harness.ctx.pool(), &plan_id).await.unwrap();
    let mut guardrails = crate::guardrails::Guardrails::new(&harness.ctx.config);
    let action = harness.task_by_title(&plan_id, "Deliver:").await;
    crate::executor::run_executor_phase(&harness.ctx, &mut guardrails, &action)
        .await
        .unwrap();

    // Snapshot the task as the reviewer would see it (v1 active)...
    let task_at_review_start = harness.task_by_title(&plan_id, "Deliver:").await;
    let v1 = task_at_review_start.active_artifact_id.clone().unwrap();

    // ...then the executor lands v2 while the review is in flight.
    let v2 = crate::artifacts::create_and_activate_artifact(
        harness.ctx.pool(),
        &harness.ctx.workspace.artifacts_dir(),
        &plan_id,
        &task_at_review_start.task_id,
        "out",
        "md",
        "v2",
        50,
    )
    .await
    .unwrap();

    crate::reviewer::run_reviewer_phase(&harness.ctx, &mut guardrails, &task_at_review_start)
        .await
        .unwrap();

    let task = harness.task_by_title(&plan_id, "Deliver:").await;
    // v1 is approved, but the task is not DONE: v2 still awaits review.
    assert_eq!(task.approved_artifact_id.as_deref(), Some(v1.as_str()));
    assert_eq!(task.active_artifact_id.as_deref(), Some(v2.as_str()));
    assert_eq!(task.status, TaskStatus::ReadyToCheck);
}

#[tokio::test]
async fn test_attempt_exhaustion_blocks_external_with_suggestions() {
    let harness = TestHarness::with_responses(vec![
        plan_response("hard task", &[]),
        plan_review_response(95, "APPROVE"),
        artifact_response("doc", "md", "try 1"),
        review_response(60, "MODIFY", &[("HIGH", "missing sections")]),
        artifact_response("doc", "md", "try 2"),
        review_response(65, "MODIFY", &[("HIGH", "still missing sections")]),
        artifact_response("doc", "md", "try 3"),
        review_response(70, "MODIFY", &[("HIGH", "final: cover all sections")]),
    ])
    .await;

    let plan_id = create_plan(&harness, "hard task").await;
    let outcome = run_plan(&harness.ctx, &plan_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::BlockedWaitingUser(_)));

    let action = harness.task_by_title(&plan_id, "Deliver:").await;
    assert_eq!(action.status, TaskStatus::Blocked);
    assert_eq!(
        action.blocked_reason,
        Some(crate::model::BlockedReason::WaitingExternal)
    );
    // Attempts frozen at the cap.
    assert_eq!(action.attempt_count, harness.ctx.config.max_task_attempts);

    // The final suggestions are preserved for the user.
    let suggestions = crate::reviews::read_suggestions_file(
        &harness.ctx.workspace.reviews_dir(),
        &action.task_id,
    )
    .await;
    assert!(suggestions.contains("final: cover all sections"));

    // Three rejected reviews on file.
    let rejected: i64 =
        sqlx::query_scalar("SELECT COUNT(1) FROM reviews WHERE action_required = 'MODIFY'")
            .fetch_one(harness.ctx.pool())
            .await
            .unwrap();
    assert_eq!(rejected, 3);
}

#[tokio::test]
async fn test_plan_gen_retry_uses_distilled_notes() {
    let harness = TestHarness::with_responses(vec![
        "this is not json at all".to_string(),
        plan_response("retry me", &[]),
        plan_review_response(93, "APPROVE"),
    ])
    .await;

    let plan_id = create_plan(&harness, "retry me").await;
    assert!(!plan_id.is_empty());

    let prompts = harness.provider.prompt_log().await;
    // First PLAN_GEN has no retry notes; the second carries a concise note.
    assert!(!prompts[0].contains("must address"));
    assert!(prompts[1].contains("must address"));
    let note_start = prompts[1].find("must address").unwrap();
    let note = &prompts[1][note_start..];
    // The note is short and never raw reviewer/plan JSON.
    assert!(note.len() < 700);
    assert!(!note.contains("schema_version"));

    // Both generation attempts are in telemetry.
    let plan_gen_calls: i64 =
        sqlx::query_scalar("SELECT COUNT(1) FROM llm_calls WHERE scope = 'PLAN_GEN'")
            .fetch_one(harness.ctx.pool())
            .await
            .unwrap();
    assert_eq!(plan_gen_calls, 2);
}

#[tokio::test]
async fn test_plan_rejected_then_approved_with_suggestion_notes() {
    let harness = TestHarness::with_responses(vec![
        plan_response("two-round plan", &[]),
        {
            // A rejection with a concrete suggestion to carry forward.
            let review = serde_json::json!({
                "schema_version": "xiaojing_review_v1",
                "review_target": "PLAN",
                "total_score": 70,
                "action_required": "MODIFY",
                "summary": "too coarse",
                "breakdown": [{"dimension": "overall", "score": 70, "max_score": 100, "issues": []}],
                "suggestions": [{"priority": "HIGH", "change": "split delivery into build and verify",
                                 "steps": [], "acceptance_criteria": "two actions"}],
            });
            review.to_string()
        },
        plan_response("two-round plan", &[]),
        plan_review_response(95, "APPROVE"),
    ])
    .await;

    let plan_id = create_plan(&harness, "two-round plan").await;
    assert!(!plan_id.is_empty());

    let prompts = harness.provider.prompt_log().await;
    // Second PLAN_GEN prompt carries the distilled suggestion, not JSON.
    let second_gen = &prompts[2];
    assert!(second_gen.contains("split delivery into build and verify"));
    assert!(!second_gen.contains("\"suggestions\""));

    // PLAN_REVIEWED then PLAN_APPROVED were journalled.
    let reviewed: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_events WHERE event_type = 'PLAN_REVIEWED'",
    )
    .fetch_one(harness.ctx.pool())
    .await
    .unwrap();
    let approved: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM task_events WHERE event_type = 'PLAN_APPROVED'",
    )
    .fetch_one(harness.ctx.pool())
    .await
    .unwrap();
    assert_eq!(reviewed, 1);
    assert_eq!(approved, 1);
}

#[tokio::test]
async fn test_iteration_fuse_trips_cleanly() {
    let mut config = RuntimeConfig::default();
    config.guardrails.max_run_iterations = 4;
    // Default scripted response is NOOP, so the READY task never advances.
    let harness = TestHarness::with_config_and_responses(
        config,
        vec![
            plan_response("spinner", &[]),
            plan_review_response(95, "APPROVE"),
        ],
    )
    .await;

    let plan_id = create_plan(&harness, "spinner").await;
    let outcome = run_plan(&harness.ctx, &plan_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::FuseTripped(FuseTrip::Iterations));

    // The trip is journalled with its scope.
    let payload: String = sqlx::query_scalar(
        "SELECT payload_json FROM task_events WHERE event_type = 'TIMEOUT'",
    )
    .fetch_one(harness.ctx.pool())
    .await
    .unwrap();
    let payload: Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(payload["scope"], "ITERATIONS");
}

#[tokio::test]
async fn test_export_after_happy_path() {
    let harness = TestHarness::with_responses(vec![
        plan_response("exportable", &[]),
        plan_review_response(95, "APPROVE"),
        artifact_response("report", "md", "# done"),
        review_response(95, "APPROVE", &[]),
    ])
    .await;

    let plan_id = create_plan(&harness, "exportable").await;
    run_plan(&harness.ctx, &plan_id).await.unwrap();

    let result = crate::deliverables::export_deliverables(
        harness.ctx.pool(),
        &harness.ctx.workspace.deliverables_dir(),
        &plan_id,
        false,
    )
    .await
    .unwrap();
    assert_eq!(result.files_copied, 1);
    assert!(result.out_dir.join("manifest.json").exists());
    assert!(result.out_dir.join("final.json").exists());
    assert!(result.out_dir.join("plan_meta.json").exists());

    let manifest: Value = serde_json::from_str(
        &std::fs::read_to_string(result.out_dir.join("manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["items"][0]["review"]["verdict"], "APPROVED");
    assert_eq!(manifest["items"][0]["files"][0]["sha256"].as_str().unwrap().len(), 64);
}
