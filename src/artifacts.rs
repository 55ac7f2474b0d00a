//! Artifact files and rows.
//!
//! Layout: `artifacts/<task_id>/<artifact_id>/<name>.<format>`. Artifacts
//! are append-only and versioned per task; `active_artifact_id` always
//! points at the most recently produced version.

use std::path::Path;

use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::events::{emit_event, EVENT_ARTIFACT_CREATED};
use crate::model::Artifact;
use crate::util::{new_uuid, safe_slug, sha256_text, utc_now_iso};

/// Returned when a task hits `max_artifact_versions_per_task`.
#[derive(Debug)]
pub struct ArtifactCapExceeded {
    pub task_id: String,
    pub cap: u64,
}

impl std::fmt::Display for ArtifactCapExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} reached the artifact version cap ({})",
            self.task_id, self.cap
        )
    }
}

impl std::error::Error for ArtifactCapExceeded {}

/// Write the artifact file, insert its row, and point the task's
/// `active_artifact_id` at it. Returns the new artifact id.
pub async fn create_and_activate_artifact(
    pool: &SqlitePool,
    artifacts_dir: &Path,
    plan_id: &str,
    task_id: &str,
    name: &str,
    format: &str,
    content: &str,
    max_versions: u64,
) -> anyhow::Result<String> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM artifacts WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(pool)
        .await?;
    if existing as u64 >= max_versions {
        return Err(anyhow::anyhow!(ArtifactCapExceeded {
            task_id: task_id.to_string(),
            cap: max_versions,
        }));
    }

    let artifact_id = new_uuid();
    let format = format.trim_start_matches('.').to_lowercase();
    let file_name = format!("{}.{}", safe_slug(name, 60), format);
    let dir = artifacts_dir.join(task_id).join(&artifact_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(&file_name);
    tokio::fs::write(&path, content).await?;

    let sha = sha256_text(content);
    let now = utc_now_iso();

    sqlx::query(
        "INSERT INTO artifacts(artifact_id, task_id, name, path, format, version, sha256, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&artifact_id)
    .bind(task_id)
    .bind(name)
    .bind(path.to_string_lossy().as_ref())
    .bind(&format)
    .bind(existing + 1)
    .bind(&sha)
    .bind(&now)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE task_nodes SET active_artifact_id = ?, updated_at = ? WHERE task_id = ?")
        .bind(&artifact_id)
        .bind(&now)
        .bind(task_id)
        .execute(pool)
        .await?;

    emit_event(
        pool,
        plan_id,
        Some(task_id),
        EVENT_ARTIFACT_CREATED,
        json!({
            "artifact_id": artifact_id,
            "path": path.to_string_lossy(),
            "sha256": sha,
            "name": name,
            "format": format,
            "version": existing + 1,
        }),
    )
    .await?;

    Ok(artifact_id)
}

pub async fn load_artifact(
    pool: &SqlitePool,
    artifact_id: &str,
) -> anyhow::Result<Option<Artifact>> {
    let row = sqlx::query(
        "SELECT artifact_id, task_id, name, path, format, version, sha256, created_at
         FROM artifacts WHERE artifact_id = ?",
    )
    .bind(artifact_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Artifact {
        artifact_id: row.get("artifact_id"),
        task_id: row.get("task_id"),
        name: row.get("name"),
        path: row.get("path"),
        format: row.get("format"),
        version: row.get("version"),
        sha256: row.get("sha256"),
        created_at: row.get("created_at"),
    }))
}

/// The artifact currently pointed at by the task's `active_artifact_id`.
pub async fn load_active_artifact(
    pool: &SqlitePool,
    task_id: &str,
) -> anyhow::Result<Option<Artifact>> {
    let artifact_id: Option<String> =
        sqlx::query_scalar("SELECT active_artifact_id FROM task_nodes WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(pool)
            .await?
            .flatten();
    match artifact_id {
        Some(id) => load_artifact(pool, &id).await,
        None => Ok(None),
    }
}
