//! Forward-only schema migrations.
//!
//! Migrations are applied in list order and recorded in `schema_migrations`;
//! a migration already recorded is never re-run. Each migration runs inside
//! its own transaction so a failure leaves the ledger consistent, and the
//! failing migration is named in the returned error.

use sqlx::SqlitePool;
use tracing::info;

use crate::util::utc_now_iso;

pub struct Migration {
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_core_tables.sql",
        statements: &[
            "CREATE TABLE IF NOT EXISTS plans (
                plan_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                owner_agent_id TEXT NOT NULL,
                root_task_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                constraints_json TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE TABLE IF NOT EXISTS task_nodes (
                task_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL REFERENCES plans(plan_id),
                node_type TEXT NOT NULL,
                title TEXT NOT NULL,
                goal_statement TEXT,
                owner_agent_id TEXT NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PENDING',
                blocked_reason TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                active_branch INTEGER NOT NULL DEFAULT 1,
                active_artifact_id TEXT,
                approved_artifact_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_task_nodes_plan_status
                ON task_nodes(plan_id, status)",
            "CREATE TABLE IF NOT EXISTS task_edges (
                edge_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL REFERENCES plans(plan_id),
                from_task_id TEXT NOT NULL,
                to_task_id TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_task_edges_plan ON task_edges(plan_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_edges_to ON task_edges(to_task_id, edge_type)",
            "CREATE TABLE IF NOT EXISTS input_requirements (
                requirement_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES task_nodes(task_id),
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                required INTEGER NOT NULL DEFAULT 1,
                min_count INTEGER NOT NULL DEFAULT 1,
                allowed_types_json TEXT NOT NULL DEFAULT '[]',
                source TEXT NOT NULL DEFAULT 'USER',
                validation_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_requirements_task ON input_requirements(task_id)",
            "CREATE TABLE IF NOT EXISTS evidences (
                evidence_id TEXT PRIMARY KEY,
                requirement_id TEXT NOT NULL REFERENCES input_requirements(requirement_id),
                evidence_type TEXT NOT NULL,
                ref_id TEXT NOT NULL,
                ref_path TEXT,
                sha256 TEXT,
                added_at TEXT NOT NULL,
                UNIQUE(requirement_id, ref_id)
            )",
            "CREATE TABLE IF NOT EXISTS artifacts (
                artifact_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES task_nodes(task_id),
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                format TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                sha256 TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id, created_at)",
            "CREATE TABLE IF NOT EXISTS reviews (
                review_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES task_nodes(task_id),
                reviewer_agent_id TEXT NOT NULL,
                reviewed_artifact_id TEXT,
                total_score INTEGER NOT NULL,
                breakdown_json TEXT NOT NULL DEFAULT '[]',
                suggestions_json TEXT NOT NULL DEFAULT '[]',
                summary TEXT NOT NULL DEFAULT '',
                action_required TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_reviews_task ON reviews(task_id, created_at)",
            "CREATE TABLE IF NOT EXISTS task_events (
                event_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL REFERENCES plans(plan_id),
                task_id TEXT,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_task_events_plan
                ON task_events(plan_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_task_events_task
                ON task_events(task_id) WHERE task_id IS NOT NULL",
        ],
    },
    Migration {
        name: "0002_llm_calls.sql",
        statements: &[
            "CREATE TABLE IF NOT EXISTS llm_calls (
                llm_call_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                started_at_ts REAL,
                finished_at_ts REAL,
                plan_id TEXT,
                task_id TEXT,
                agent TEXT NOT NULL,
                scope TEXT NOT NULL,
                shared_prompt_version TEXT,
                shared_prompt_hash TEXT,
                agent_prompt_version TEXT,
                agent_prompt_hash TEXT,
                prompt_text TEXT NOT NULL,
                response_text TEXT NOT NULL,
                parsed_json TEXT,
                normalized_json TEXT,
                validator_error TEXT,
                error_code TEXT,
                error_message TEXT,
                meta_json TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_llm_calls_plan
                ON llm_calls(plan_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_llm_calls_scope ON llm_calls(scope, created_at)",
        ],
    },
    Migration {
        name: "0003_input_files.sql",
        statements: &[
            "CREATE TABLE IF NOT EXISTS input_files (
                input_file_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                path TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                mtime_utc TEXT NOT NULL DEFAULT '',
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                removed_at TEXT,
                UNIQUE(plan_id, path, sha256)
            )",
            "CREATE INDEX IF NOT EXISTS idx_input_files_plan ON input_files(plan_id)",
        ],
    },
    Migration {
        name: "0004_error_counters.sql",
        statements: &[
            "CREATE TABLE IF NOT EXISTS task_error_counters (
                plan_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                key TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (plan_id, task_id, key)
            )",
        ],
    },
    Migration {
        name: "0005_skill_runs.sql",
        statements: &[
            "CREATE TABLE IF NOT EXISTS skill_runs (
                skill_run_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                skill_name TEXT NOT NULL,
                inputs_json TEXT NOT NULL DEFAULT '[]',
                params_json TEXT NOT NULL DEFAULT '{}',
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                outputs_json TEXT NOT NULL DEFAULT '[]',
                error_json TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_skill_runs_task ON skill_runs(task_id)",
        ],
    },
    Migration {
        name: "0006_prompt_registry.sql",
        statements: &[
            "CREATE TABLE IF NOT EXISTS prompts (
                kind TEXT NOT NULL,
                agent TEXT NOT NULL DEFAULT '-',
                version TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                text TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (kind, agent, version)
            )",
        ],
    },
    Migration {
        name: "0007_v2_workflow_columns.sql",
        statements: &[
            "ALTER TABLE task_nodes ADD COLUMN estimated_person_days REAL",
            "ALTER TABLE task_nodes ADD COLUMN deliverable_spec_json TEXT",
            "ALTER TABLE task_nodes ADD COLUMN acceptance_criteria_json TEXT",
            "ALTER TABLE task_nodes ADD COLUMN review_target_task_id TEXT",
        ],
    },
];

/// Name of the most recent migration; the doctor checks it has been applied.
pub fn latest_migration_name() -> &'static str {
    MIGRATIONS
        .last()
        .map(|m| m.name)
        .unwrap_or("")
}

pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            filename TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for migration in MIGRATIONS {
        let applied =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM schema_migrations WHERE filename = ?")
                .bind(migration.name)
                .fetch_one(pool)
                .await?;
        if applied > 0 {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow::anyhow!("migration {} failed: {}", migration.name, e))?;
        }
        sqlx::query("INSERT INTO schema_migrations(filename, applied_at) VALUES(?, ?)")
            .bind(migration.name)
            .bind(utc_now_iso())
            .execute(&mut *tx)
            .await?;
        tx.commit()
            .await
            .map_err(|e| anyhow::anyhow!("migration {} failed to commit: {}", migration.name, e))?;

        info!(migration = migration.name, "Applied migration");
    }

    Ok(())
}
