//! Matcher: map dropped input files to requirements and bind evidence.
//!
//! Scoring is deterministic:
//!   +100 directory name equals the requirement name
//!   +40 per filename keyword hit (contribution capped at +80)
//!   +10 extension listed in allowed_types
//!   +10 source=USER and the file lies under inputs/
//! A file binds only at score >= 60, to at most the two highest-scoring
//! requirements; a top-score tie between distinct requirements binds nothing
//! and emits a directive event instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::events::{
    emit_event, EVENT_EVIDENCE_ADDED, EVENT_EVIDENCE_CONFLICT, EVENT_FILE_OBSERVED,
    EVENT_FILE_REMOVED,
};
use crate::model::Evidence;
use crate::util::{new_uuid, sha256_file, utc_now_iso};

pub const BIND_THRESHOLD: i64 = 60;
pub const MAX_BINDINGS_PER_FILE: usize = 2;

#[derive(Debug, Clone)]
pub struct MatchRequirement {
    pub requirement_id: String,
    pub task_id: String,
    pub name: String,
    pub required: bool,
    pub min_count: i64,
    pub allowed_types: Vec<String>,
    pub source: String,
    pub filename_keywords: Vec<String>,
}

pub async fn load_requirements(
    pool: &SqlitePool,
    plan_id: &str,
) -> anyhow::Result<Vec<MatchRequirement>> {
    let rows = sqlx::query(
        "SELECT r.requirement_id, r.task_id, r.name, r.required, r.min_count,
                r.allowed_types_json, r.source, r.validation_json
         FROM input_requirements r
         JOIN task_nodes n ON n.task_id = r.task_id
         WHERE n.plan_id = ?",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let allowed_json: String = row.get("allowed_types_json");
        let validation_json: String = row.get("validation_json");
        let allowed_types: Vec<String> = serde_json::from_str::<Vec<String>>(&allowed_json)
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim_start_matches('.').to_lowercase())
            .collect();
        let validation: serde_json::Value =
            serde_json::from_str(&validation_json).unwrap_or_default();
        let filename_keywords: Vec<String> = validation
            .get("filename_keywords")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        out.push(MatchRequirement {
            requirement_id: row.get("requirement_id"),
            task_id: row.get("task_id"),
            name: row.get("name"),
            required: row.get::<i64, _>("required") != 0,
            min_count: row.get("min_count"),
            allowed_types,
            source: row.get("source"),
            filename_keywords,
        });
    }
    Ok(out)
}

/// Deterministic match score plus the reasons that produced it.
pub fn score_match(
    req: &MatchRequirement,
    file_path: &Path,
    inputs_dir: &Path,
) -> (i64, Vec<String>) {
    let mut score = 0i64;
    let mut reasons = Vec::new();

    let under_inputs = file_path.starts_with(inputs_dir);
    let first_dir = file_path
        .strip_prefix(inputs_dir)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|c| c.as_os_str().to_str())
        .map(str::to_lowercase);

    if first_dir.as_deref() == Some(req.name.to_lowercase().as_str()) {
        score += 100;
        reasons.push("dir_map:+100".to_string());
    }

    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();

    let mut keyword_points = 0i64;
    let mut hits = 0usize;
    for keyword in &req.filename_keywords {
        if filename.contains(keyword.as_str()) {
            hits += 1;
            keyword_points += 40;
        }
    }
    if hits > 0 {
        let capped = keyword_points.min(80);
        score += capped;
        reasons.push(format!("filename_keywords:{}:+{}", hits, capped));
    }

    let ext = file_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !ext.is_empty() && req.allowed_types.iter().any(|t| t == &ext) {
        score += 10;
        reasons.push("type:+10".to_string());
    }

    if req.source == "USER" && under_inputs {
        score += 10;
        reasons.push("source_user:+10".to_string());
    }

    (score, reasons)
}

fn collect_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

struct CachedFile {
    sha256: String,
    size_bytes: i64,
    mtime_utc: String,
}

async fn load_file_cache(
    pool: &SqlitePool,
    plan_id: &str,
) -> anyhow::Result<HashMap<String, CachedFile>> {
    let rows = sqlx::query(
        "SELECT path, sha256, size_bytes, mtime_utc, last_seen_at
         FROM input_files WHERE plan_id = ?
         ORDER BY last_seen_at ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    let mut by_path = HashMap::new();
    for row in rows {
        // Later rows win (ordered by last_seen_at).
        by_path.insert(
            row.get::<String, _>("path"),
            CachedFile {
                sha256: row.get("sha256"),
                size_bytes: row.get("size_bytes"),
                mtime_utc: row.get("mtime_utc"),
            },
        );
    }
    Ok(by_path)
}

fn mtime_utc_iso(path: &Path) -> String {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| {
            chrono::DateTime::<chrono::Utc>::from(t)
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        })
        .unwrap_or_default()
}

/// Scan the inputs tree and bind evidence. Returns how many evidence rows
/// were inserted this pass.
pub async fn scan_inputs_and_bind_evidence(
    pool: &SqlitePool,
    plan_id: &str,
    inputs_dir: &Path,
) -> anyhow::Result<u64> {
    let requirements = load_requirements(pool, plan_id).await?;
    if requirements.is_empty() || !inputs_dir.exists() {
        return Ok(0);
    }

    let file_cache = load_file_cache(pool, plan_id).await?;
    let mut bound = 0u64;

    for file_path in collect_files(inputs_dir) {
        let path_str = file_path.to_string_lossy().into_owned();
        let mtime = mtime_utc_iso(&file_path);
        let size_bytes = std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0);

        // Unchanged files keep their cached hash; new or modified content is
        // re-hashed and re-observed.
        let cached = file_cache.get(&path_str);
        let sha = match cached {
            Some(c) if c.mtime_utc == mtime && c.size_bytes == size_bytes && !c.sha256.is_empty() => {
                c.sha256.clone()
            }
            _ => sha256_file(&file_path).await?,
        };

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO input_files(
                input_file_id, plan_id, path, sha256, size_bytes, mtime_utc,
                first_seen_at, last_seen_at, removed_at
            ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(new_uuid())
        .bind(plan_id)
        .bind(&path_str)
        .bind(&sha)
        .bind(size_bytes)
        .bind(&mtime)
        .bind(utc_now_iso())
        .bind(utc_now_iso())
        .execute(pool)
        .await?
        .rows_affected();
        sqlx::query(
            "UPDATE input_files SET last_seen_at = ?, removed_at = NULL
             WHERE plan_id = ? AND path = ? AND sha256 = ?",
        )
        .bind(utc_now_iso())
        .bind(plan_id)
        .bind(&path_str)
        .bind(&sha)
        .execute(pool)
        .await?;

        if inserted > 0 {
            emit_event(
                pool,
                plan_id,
                None,
                EVENT_FILE_OBSERVED,
                json!({"path": path_str, "sha256": sha, "size_bytes": size_bytes}),
            )
            .await?;
        }

        let mut candidates: Vec<(i64, &MatchRequirement, Vec<String>)> = requirements
            .iter()
            .map(|req| {
                let (score, reasons) = score_match(req, &file_path, inputs_dir);
                (score, req, reasons)
            })
            .filter(|(score, _, _)| *score >= BIND_THRESHOLD)
            .collect();

        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.requirement_id.cmp(&b.1.requirement_id)));

        let top_score = candidates[0].0;
        let tied: Vec<&(i64, &MatchRequirement, Vec<String>)> = candidates
            .iter()
            .filter(|(score, _, _)| *score == top_score)
            .collect();
        if tied.len() > 1 {
            emit_event(
                pool,
                plan_id,
                Some(&tied[0].1.task_id),
                EVENT_EVIDENCE_CONFLICT,
                json!({
                    "file": path_str,
                    "sha256": sha,
                    "score": top_score,
                    "tied_requirements": tied.iter().map(|(_, r, _)| json!({
                        "requirement_id": r.requirement_id,
                        "name": r.name,
                    })).collect::<Vec<_>>(),
                    "suggestion": "Place the file under inputs/<requirement_name>/ to disambiguate.",
                }),
            )
            .await?;
            continue;
        }

        for (score, req, reasons) in candidates.into_iter().take(MAX_BINDINGS_PER_FILE) {
            let evidence = Evidence {
                evidence_id: new_uuid(),
                requirement_id: req.requirement_id.clone(),
                evidence_type: "FILE".to_string(),
                ref_id: sha.clone(),
                ref_path: Some(path_str.clone()),
                sha256: Some(sha.clone()),
                added_at: utc_now_iso(),
            };
            // Idempotent on (requirement_id, ref_id=sha); re-binding is a no-op.
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO evidences(
                    evidence_id, requirement_id, evidence_type, ref_id, ref_path, sha256, added_at
                ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&evidence.evidence_id)
            .bind(&evidence.requirement_id)
            .bind(&evidence.evidence_type)
            .bind(&evidence.ref_id)
            .bind(&evidence.ref_path)
            .bind(&evidence.sha256)
            .bind(&evidence.added_at)
            .execute(pool)
            .await?
            .rows_affected();

            if inserted > 0 {
                bound += 1;
                emit_event(
                    pool,
                    plan_id,
                    Some(&req.task_id),
                    EVENT_EVIDENCE_ADDED,
                    json!({
                        "requirement_id": req.requirement_id,
                        "requirement_name": req.name,
                        "file": path_str,
                        "sha256": sha,
                        "match_score": score,
                        "match_reasons": reasons,
                    }),
                )
                .await?;
            }
        }
    }

    if bound > 0 {
        debug!(plan_id, bound, "evidence bound from inputs scan");
    }
    Ok(bound)
}

/// Deletions are not propagated to evidence (history is preserved); the
/// journal just records that the file disappeared.
pub async fn detect_removed_input_files(
    pool: &SqlitePool,
    plan_id: &str,
    inputs_dir: &Path,
) -> anyhow::Result<u64> {
    let rows = sqlx::query(
        "SELECT path, sha256 FROM input_files WHERE plan_id = ? AND removed_at IS NULL",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;

    let mut removed = 0u64;
    for row in rows {
        let path_str: String = row.get("path");
        let sha: String = row.get("sha256");
        let path = Path::new(&path_str);
        if !path.starts_with(inputs_dir) || path.exists() {
            continue;
        }
        removed += 1;
        sqlx::query(
            "UPDATE input_files SET removed_at = ? WHERE plan_id = ? AND path = ? AND sha256 = ?",
        )
        .bind(utc_now_iso())
        .bind(plan_id)
        .bind(&path_str)
        .bind(&sha)
        .execute(pool)
        .await?;
        emit_event(
            pool,
            plan_id,
            None,
            EVENT_FILE_REMOVED,
            json!({"path": path_str, "sha256": sha}),
        )
        .await?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, keywords: &[&str], types: &[&str], source: &str) -> MatchRequirement {
        MatchRequirement {
            requirement_id: format!("req-{}", name),
            task_id: "task-1".to_string(),
            name: name.to_string(),
            required: true,
            min_count: 1,
            allowed_types: types.iter().map(|s| s.to_string()).collect(),
            source: source.to_string(),
            filename_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_directory_match_dominates() {
        let inputs = Path::new("/ws/inputs");
        let r = req("product_spec", &[], &["md"], "USER");
        let (score, reasons) = score_match(&r, Path::new("/ws/inputs/product_spec/spec.md"), inputs);
        // dir +100, ext +10, user +10
        assert_eq!(score, 120);
        assert!(reasons.iter().any(|r| r == "dir_map:+100"));
    }

    #[test]
    fn test_keyword_contribution_capped_at_80() {
        let inputs = Path::new("/ws/inputs");
        let r = req("doc", &["spec", "prd", "final"], &[], "AGENT");
        let (score, _) = score_match(&r, Path::new("/ws/inputs/misc/spec_prd_final.txt"), inputs);
        // three hits would be +120; cap is +80
        assert_eq!(score, 80);
    }

    #[test]
    fn test_below_threshold_means_no_bind() {
        let inputs = Path::new("/ws/inputs");
        let r = req("product_spec", &[], &["md"], "USER");
        // Wrong directory, no keywords: ext + user = 20 < 60.
        let (score, _) = score_match(&r, Path::new("/ws/inputs/other/readme.md"), inputs);
        assert!(score < BIND_THRESHOLD);
    }

    mod db {
        use super::*;
        use crate::plan_import::upsert_plan;
        use crate::store::Store;
        use crate::contracts::{normalize_and_validate, ContractContext, Scope};
        use serde_json::json;

        async fn setup(inputs_root: &Path) -> (Store, String) {
            let store = Store::open_in_memory().await.unwrap();
            let raw = json!({
                "plan": {"title": "Spec work"},
                "nodes": [{"id": "write", "type": "ACTION", "title": "Write"}],
                "requirements": [
                    {"task_id": "write", "name": "product_spec", "kind": "FILE",
                     "min_count": 1, "allowed_types": ["md"], "source": "USER",
                     "validation": {"filename_keywords": ["spec"]}},
                ],
            });
            let (normalized, err) =
                normalize_and_validate(Scope::PlanGen, &raw, &ContractContext::default());
            assert!(err.is_none(), "{:?}", err);
            let plan_id = upsert_plan(store.pool(), &normalized).await.unwrap();
            std::fs::create_dir_all(inputs_root.join("product_spec")).unwrap();
            (store, plan_id)
        }

        #[tokio::test]
        async fn test_bind_and_idempotency() {
            let tmp = tempfile::tempdir().unwrap();
            let inputs = tmp.path().join("inputs");
            let (store, plan_id) = setup(&inputs).await;
            std::fs::write(inputs.join("product_spec/spec.md"), "# spec").unwrap();

            let bound = scan_inputs_and_bind_evidence(store.pool(), &plan_id, &inputs)
                .await
                .unwrap();
            assert_eq!(bound, 1);

            // Second scan binds nothing new.
            let bound = scan_inputs_and_bind_evidence(store.pool(), &plan_id, &inputs)
                .await
                .unwrap();
            assert_eq!(bound, 0);

            let evidence: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM evidences")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(evidence, 1);
        }

        #[tokio::test]
        async fn test_removed_file_journalled_but_evidence_kept() {
            let tmp = tempfile::tempdir().unwrap();
            let inputs = tmp.path().join("inputs");
            let (store, plan_id) = setup(&inputs).await;
            let file = inputs.join("product_spec/spec.md");
            std::fs::write(&file, "# spec").unwrap();

            scan_inputs_and_bind_evidence(store.pool(), &plan_id, &inputs)
                .await
                .unwrap();
            std::fs::remove_file(&file).unwrap();

            let removed = detect_removed_input_files(store.pool(), &plan_id, &inputs)
                .await
                .unwrap();
            assert_eq!(removed, 1);

            let evidence: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM evidences")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(evidence, 1);

            let events: i64 = sqlx::query_scalar(
                "SELECT COUNT(1) FROM task_events WHERE event_type = 'FILE_REMOVED'",
            )
            .fetch_one(store.pool())
            .await
            .unwrap();
            assert_eq!(events, 1);
        }
    }
}
