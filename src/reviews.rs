//! Review rows and human-readable verdict files.
//!
//! Layout: `reviews/<task_id>/<review_id>/{APPROVED,REJECTED}.md`. Reviews
//! are append-only; the task's artifact pointers move, the rows never do.

use std::path::Path;

use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};

use crate::events::{emit_event, EVENT_REVIEW_CREATED};
use crate::model::{Review, ReviewAction};
use crate::util::{new_uuid, utc_now_iso};

pub async fn insert_review(
    pool: &SqlitePool,
    plan_id: &str,
    task_id: &str,
    reviewer_agent_id: &str,
    reviewed_artifact_id: Option<&str>,
    review: &Value,
) -> anyhow::Result<String> {
    let review_id = new_uuid();
    let total_score = review.get("total_score").and_then(Value::as_i64).unwrap_or(0);
    let action = review
        .get("action_required")
        .and_then(Value::as_str)
        .unwrap_or("MODIFY");

    sqlx::query(
        "INSERT INTO reviews(
            review_id, task_id, reviewer_agent_id, reviewed_artifact_id,
            total_score, breakdown_json, suggestions_json, summary, action_required, created_at
        ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&review_id)
    .bind(task_id)
    .bind(reviewer_agent_id)
    .bind(reviewed_artifact_id)
    .bind(total_score)
    .bind(review.get("breakdown").cloned().unwrap_or(json!([])).to_string())
    .bind(review.get("suggestions").cloned().unwrap_or(json!([])).to_string())
    .bind(review.get("summary").and_then(Value::as_str).unwrap_or(""))
    .bind(action)
    .bind(utc_now_iso())
    .execute(pool)
    .await?;

    emit_event(
        pool,
        plan_id,
        Some(task_id),
        EVENT_REVIEW_CREATED,
        json!({
            "review_id": review_id,
            "total_score": total_score,
            "action_required": action,
            "reviewed_artifact_id": reviewed_artifact_id,
        }),
    )
    .await?;

    Ok(review_id)
}

/// The most recent review that pinned `artifact_id` as its version lock.
pub async fn latest_review_for_artifact(
    pool: &SqlitePool,
    artifact_id: &str,
) -> anyhow::Result<Option<Review>> {
    let row = sqlx::query(
        "SELECT review_id, task_id, reviewer_agent_id, reviewed_artifact_id,
                total_score, breakdown_json, suggestions_json, summary, action_required, created_at
         FROM reviews WHERE reviewed_artifact_id = ?
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(artifact_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| {
        let action: String = row.get("action_required");
        Review {
            review_id: row.get("review_id"),
            task_id: row.get("task_id"),
            reviewer_agent_id: row.get("reviewer_agent_id"),
            reviewed_artifact_id: row.get("reviewed_artifact_id"),
            total_score: row.get("total_score"),
            breakdown: serde_json::from_str(&row.get::<String, _>("breakdown_json"))
                .unwrap_or(json!([])),
            suggestions: serde_json::from_str(&row.get::<String, _>("suggestions_json"))
                .unwrap_or(json!([])),
            summary: row.get("summary"),
            action_required: ReviewAction::from_str(&action).unwrap_or(ReviewAction::Modify),
            created_at: row.get("created_at"),
        }
    }))
}

/// Write the verdict file a human can read without the database.
pub async fn write_review_file(
    reviews_dir: &Path,
    task_id: &str,
    review_id: &str,
    review: &Value,
    approved: bool,
) -> anyhow::Result<std::path::PathBuf> {
    let dir = reviews_dir.join(task_id).join(review_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(if approved { "APPROVED.md" } else { "REJECTED.md" });

    let score = review.get("total_score").and_then(Value::as_i64).unwrap_or(0);
    let action = review
        .get("action_required")
        .and_then(Value::as_str)
        .unwrap_or("");
    let summary = review.get("summary").and_then(Value::as_str).unwrap_or("");

    let mut lines = vec![
        format!("# Review {} for task {}", review_id, task_id),
        String::new(),
        format!("- verdict: {}", if approved { "APPROVED" } else { "REJECTED" }),
        format!("- total_score: {}", score),
        format!("- action_required: {}", action),
        format!("- summary: {}", summary),
    ];

    let suggestions = review
        .get("suggestions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !suggestions.is_empty() {
        lines.push(String::new());
        lines.push("## Suggestions".to_string());
        for suggestion in &suggestions {
            let priority = suggestion.get("priority").and_then(Value::as_str).unwrap_or("MED");
            let change = suggestion.get("change").and_then(Value::as_str).unwrap_or("");
            lines.push(format!("- [{}] {}", priority, change));
            for step in suggestion
                .get("steps")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
            {
                lines.push(format!("  - {}", step));
            }
        }
    }
    lines.push(String::new());

    tokio::fs::write(&path, lines.join("\n")).await?;
    Ok(path)
}

/// Persist the reviewer's latest suggestions for the executor's next round.
pub async fn write_suggestions_file(
    reviews_dir: &Path,
    task_id: &str,
    suggestions: &Value,
) -> anyhow::Result<()> {
    let dir = reviews_dir.join(task_id);
    tokio::fs::create_dir_all(&dir).await?;
    let mut lines = Vec::new();
    for suggestion in suggestions.as_array().into_iter().flatten() {
        let priority = suggestion.get("priority").and_then(Value::as_str).unwrap_or("MED");
        let change = suggestion.get("change").and_then(Value::as_str).unwrap_or("");
        lines.push(format!("- [{}] {}", priority, change));
        for step in suggestion
            .get("steps")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            lines.push(format!("  - {}", step));
        }
        if let Some(criteria) = suggestion.get("acceptance_criteria").and_then(Value::as_str) {
            lines.push(format!("  - done when: {}", criteria));
        }
    }
    if lines.is_empty() {
        lines.push("- (no structured suggestions were provided)".to_string());
    }
    lines.push(String::new());
    tokio::fs::write(dir.join("suggestions.md"), lines.join("\n")).await?;
    Ok(())
}

pub async fn read_suggestions_file(reviews_dir: &Path, task_id: &str) -> String {
    let path = reviews_dir.join(task_id).join("suggestions.md");
    tokio::fs::read_to_string(&path).await.unwrap_or_default()
}
