//! Row retention: keep append-only tables inside their configured caps.
//!
//! Telemetry and the event journal grow without bound on long runs; this
//! prunes oldest-first so the recent history an operator actually reads is
//! always intact. Runs at the end of each `run` invocation.

use sqlx::SqlitePool;
use tracing::info;

use crate::config::GuardrailsConfig;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub llm_calls_pruned: u64,
    pub task_events_pruned: u64,
    pub reviews_pruned: u64,
}

impl RetentionReport {
    pub fn total(&self) -> u64 {
        self.llm_calls_pruned + self.task_events_pruned + self.reviews_pruned
    }
}

pub async fn enforce_retention(
    pool: &SqlitePool,
    guardrails: &GuardrailsConfig,
) -> anyhow::Result<RetentionReport> {
    let mut report = RetentionReport::default();

    // Global llm_calls cap, oldest first.
    report.llm_calls_pruned += sqlx::query(
        "DELETE FROM llm_calls WHERE llm_call_id IN (
            SELECT llm_call_id FROM llm_calls
            ORDER BY created_at DESC
            LIMIT -1 OFFSET ?
        )",
    )
    .bind(guardrails.max_llm_calls_rows as i64)
    .execute(pool)
    .await?
    .rows_affected();

    // Per-task event cap. ERROR events are kept preferentially by pruning
    // the oldest non-error rows first.
    let task_ids: Vec<String> = sqlx::query_scalar(
        "SELECT task_id FROM task_events
         WHERE task_id IS NOT NULL
         GROUP BY task_id
         HAVING COUNT(1) > ?",
    )
    .bind(guardrails.max_task_events_per_task as i64)
    .fetch_all(pool)
    .await?;
    for task_id in task_ids {
        report.task_events_pruned += sqlx::query(
            "DELETE FROM task_events WHERE event_id IN (
                SELECT event_id FROM task_events
                WHERE task_id = ?
                ORDER BY (event_type = 'ERROR') DESC, created_at DESC
                LIMIT -1 OFFSET ?
            )",
        )
        .bind(&task_id)
        .bind(guardrails.max_task_events_per_task as i64)
        .execute(pool)
        .await?
        .rows_affected();
    }

    // Global event cap.
    report.task_events_pruned += sqlx::query(
        "DELETE FROM task_events WHERE event_id IN (
            SELECT event_id FROM task_events
            ORDER BY created_at DESC
            LIMIT -1 OFFSET ?
        )",
    )
    .bind(guardrails.max_task_events_rows as i64)
    .execute(pool)
    .await?
    .rows_affected();

    // Per-task review version cap, newest kept.
    let review_tasks: Vec<String> = sqlx::query_scalar(
        "SELECT task_id FROM reviews GROUP BY task_id HAVING COUNT(1) > ?",
    )
    .bind(guardrails.max_review_versions_per_check as i64)
    .fetch_all(pool)
    .await?;
    for task_id in review_tasks {
        report.reviews_pruned += sqlx::query(
            "DELETE FROM reviews WHERE review_id IN (
                SELECT review_id FROM reviews
                WHERE task_id = ?
                ORDER BY created_at DESC
                LIMIT -1 OFFSET ?
            )",
        )
        .bind(&task_id)
        .bind(guardrails.max_review_versions_per_check as i64)
        .execute(pool)
        .await?
        .rows_affected();
    }

    if report.total() > 0 {
        info!(
            llm_calls = report.llm_calls_pruned,
            task_events = report.task_events_pruned,
            reviews = report.reviews_pruned,
            "retention pruned rows"
        );
    }
    Ok(report)
}
