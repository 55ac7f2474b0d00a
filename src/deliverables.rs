//! Deliverable export: collect approved outputs into a handoff bundle.
//!
//! Layout under `deliverables/<plan_id>/`:
//!   bundle/<task_slug>_<task_id8>/<files>
//!   manifest.json   - catalog with hashes and review provenance
//!   final.json      - single-entrypoint descriptor
//!   plan_meta.json  - plan header

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};

use crate::util::{safe_slug, sha256_file, utc_now_iso};

#[derive(Debug)]
pub struct ExportResult {
    pub plan_id: String,
    pub out_dir: PathBuf,
    pub files_copied: u64,
}

#[derive(Debug)]
pub struct NoDeliverables;

impl std::fmt::Display for NoDeliverables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(
            "No approved deliverables found. Next: let reviews approve ACTION artifacts, then re-run export.",
        )
    }
}

impl std::error::Error for NoDeliverables {}

struct ExportRow {
    task_id: String,
    task_title: String,
    artifact_id: String,
    artifact_name: String,
    artifact_format: String,
    artifact_path: String,
    artifact_sha256: String,
    artifact_created_at: String,
    approved_artifact_id: Option<String>,
    tags_json: String,
}

async fn load_export_rows(
    pool: &SqlitePool,
    plan_id: &str,
    include_candidates: bool,
) -> anyhow::Result<Vec<ExportRow>> {
    let rows = sqlx::query(
        "SELECT
            n.task_id, n.title, n.tags_json, n.approved_artifact_id,
            a.artifact_id, a.name AS artifact_name, a.format AS artifact_format,
            a.path AS artifact_path, a.sha256 AS artifact_sha256,
            a.created_at AS artifact_created_at
         FROM task_nodes n
         JOIN artifacts a ON a.artifact_id = CASE
             WHEN n.approved_artifact_id IS NOT NULL THEN n.approved_artifact_id
             WHEN ? THEN n.active_artifact_id
             ELSE NULL
         END
         WHERE n.plan_id = ?
           AND n.active_branch = 1
           AND n.node_type = 'ACTION'
           AND n.status = 'DONE'
         ORDER BY a.created_at ASC",
    )
    .bind(if include_candidates { 1 } else { 0 })
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ExportRow {
            task_id: row.get("task_id"),
            task_title: row.get("title"),
            artifact_id: row.get("artifact_id"),
            artifact_name: row.get("artifact_name"),
            artifact_format: row.get("artifact_format"),
            artifact_path: row.get("artifact_path"),
            artifact_sha256: row.get("artifact_sha256"),
            artifact_created_at: row.get("artifact_created_at"),
            approved_artifact_id: row.get("approved_artifact_id"),
            tags_json: row.get("tags_json"),
        })
        .collect())
}

async fn review_for_artifact(
    pool: &SqlitePool,
    artifact_id: &str,
) -> anyhow::Result<Option<Value>> {
    let review = crate::reviews::latest_review_for_artifact(pool, artifact_id).await?;
    Ok(review.map(|review| {
        let approved = review.action_required == crate::model::ReviewAction::Approve;
        json!({
            "check_task_id": review.task_id,
            "review_id": review.review_id,
            "verdict": if approved { "APPROVED" } else { "REJECTED" },
            "score": review.total_score,
        })
    }))
}

/// Export approved deliverables (candidates too when configured) into the
/// bundle directory and write the catalog files.
pub async fn export_deliverables(
    pool: &SqlitePool,
    deliverables_dir: &Path,
    plan_id: &str,
    include_candidates: bool,
) -> anyhow::Result<ExportResult> {
    let plan = sqlx::query(
        "SELECT plan_id, title, root_task_id, created_at FROM plans WHERE plan_id = ?",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow::anyhow!("plan not found: {}", plan_id))?;

    let out_dir = deliverables_dir.join(plan_id);
    let bundle_dir = out_dir.join("bundle");
    tokio::fs::create_dir_all(&bundle_dir).await?;

    let plan_meta = json!({
        "plan_id": plan.get::<String, _>("plan_id"),
        "title": plan.get::<String, _>("title"),
        "root_task_id": plan.get::<String, _>("root_task_id"),
        "created_at": plan.get::<String, _>("created_at"),
        "exported_at": utc_now_iso(),
    });
    tokio::fs::write(
        out_dir.join("plan_meta.json"),
        serde_json::to_string_pretty(&plan_meta)?,
    )
    .await?;

    let rows = load_export_rows(pool, plan_id, include_candidates).await?;
    let mut items = Vec::new();
    let mut files_copied = 0u64;

    for row in &rows {
        let source = Path::new(&row.artifact_path);
        if !source.exists() {
            continue;
        }
        let task_slug = format!("{}_{}", safe_slug(&row.task_title, 60), &row.task_id[..8.min(row.task_id.len())]);
        let dest_dir = bundle_dir.join(&task_slug);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("deliverable")
            .to_string();
        let dest = dest_dir.join(&file_name);
        tokio::fs::copy(source, &dest).await?;
        files_copied += 1;
        let dest_sha = sha256_file(&dest).await?;

        let review = review_for_artifact(pool, &row.artifact_id).await?;
        items.push(json!({
            "task_id": row.task_id,
            "task_title": row.task_title,
            "deliverable": {
                "format": row.artifact_format,
                "filename": file_name,
                "single_file": true,
                "bundle_mode": "copy",
            },
            "approved_artifact_id": row.approved_artifact_id,
            "files": [{
                "dest_path": format!("bundle/{}/{}", task_slug, dest.file_name().and_then(|n| n.to_str()).unwrap_or("")),
                "source_path": row.artifact_path,
                "sha256": dest_sha,
            }],
            "review": review,
        }));
    }

    let manifest = json!({
        "plan": plan_meta,
        "include_candidates": include_candidates,
        "items": items,
    });
    tokio::fs::write(
        out_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )
    .await?;

    // Single-entrypoint descriptor.
    match pick_final_deliverable(pool, plan_id, include_candidates).await {
        Ok(final_desc) => {
            tokio::fs::write(
                out_dir.join("final.json"),
                serde_json::to_string_pretty(&final_desc)?,
            )
            .await?;
        }
        Err(e) if e.downcast_ref::<NoDeliverables>().is_some() => {}
        Err(e) => return Err(e),
    }

    Ok(ExportResult {
        plan_id: plan_id.to_string(),
        out_dir,
        files_copied,
    })
}

fn is_finalish(title: &str, tags: &[String]) -> bool {
    let title = title.to_lowercase();
    tags.iter().any(|t| {
        let t = t.to_lowercase();
        t == "final" || t == "package"
    }) || title.contains("final")
        || title.contains("package")
}

/// Pick the single final deliverable:
/// 1. a root-GOAL deliverable_spec filename/format match,
/// 2. a DONE ACTION tagged (or titled) final/package,
/// 3. the most recently approved artifact.
pub async fn pick_final_deliverable(
    pool: &SqlitePool,
    plan_id: &str,
    include_candidates: bool,
) -> anyhow::Result<Value> {
    let root_spec: Option<String> = sqlx::query_scalar(
        "SELECT n.deliverable_spec_json
         FROM plans p JOIN task_nodes n ON n.task_id = p.root_task_id
         WHERE p.plan_id = ?",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?
    .flatten();
    let spec: Value = root_spec
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);
    let desired_filename = spec
        .get("filename")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    let desired_format = spec
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();

    let rows = load_export_rows(pool, plan_id, include_candidates).await?;
    if rows.is_empty() {
        return Err(anyhow::anyhow!(NoDeliverables));
    }

    let score = |row: &ExportRow| -> (i64, i64, String) {
        let tags: Vec<String> = serde_json::from_str(&row.tags_json).unwrap_or_default();
        let file_name = Path::new(&row.artifact_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_lowercase();
        let name_match = !desired_filename.is_empty() && file_name == desired_filename;
        let format_match =
            !desired_format.is_empty() && row.artifact_format.to_lowercase() == desired_format;
        let spec_match = if name_match && (desired_format.is_empty() || format_match) {
            10
        } else if name_match {
            5
        } else if format_match {
            3
        } else {
            0
        };
        let finalish = if is_finalish(&row.task_title, &tags) { 2 } else { 0 };
        (spec_match, finalish, row.artifact_created_at.clone())
    };

    let best = rows
        .iter()
        .max_by(|a, b| score(a).cmp(&score(b)))
        .expect("non-empty rows");

    let (spec_match, finalish, _) = score(best);
    let mut reasoning = Vec::new();
    if !desired_filename.is_empty() || !desired_format.is_empty() {
        reasoning.push(if spec_match >= 5 {
            "matched_root_deliverable_spec"
        } else {
            "root_spec_present_but_not_matched"
        });
    }
    if finalish > 0 {
        reasoning.push("final_tag_or_title");
    }
    reasoning.push("latest_approved_artifact_fallback");

    let source = Path::new(&best.artifact_path);
    let mut entrypoint = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("deliverable")
        .to_string();
    if best.artifact_format == "html" && !entrypoint.to_lowercase().ends_with(".html") {
        entrypoint.push_str(".html");
    }

    Ok(json!({
        "task_id": best.task_id,
        "task_title": best.task_title,
        "artifact_id": best.artifact_id,
        "artifact_name": best.artifact_name,
        "source_path": best.artifact_path,
        "sha256": best.artifact_sha256,
        "format": best.artifact_format,
        "entrypoint_filename": entrypoint,
        "reasoning": reasoning,
    }))
}
