//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                lead_name TEXT NOT NULL,
                history TEXT NOT NULL DEFAULT '[]',
                funnel_stage TEXT,
                lead_context TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS drafts (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                lead_name TEXT NOT NULL,
                lead_message TEXT NOT NULL,
                generated_text TEXT NOT NULL,
                pre_revision_text TEXT,
                human_edited_text TEXT,
                sent_text TEXT,
                stage TEXT NOT NULL,
                stage_reasoning TEXT NOT NULL DEFAULT '',
                judge_score REAL,
                judge_scores TEXT,
                judge_feedback TEXT,
                revision_count INTEGER NOT NULL DEFAULT 0,
                qa_score REAL,
                qa_verdict TEXT,
                qa_issues TEXT NOT NULL DEFAULT '[]',
                qa_reasoning TEXT,
                qa_model TEXT,
                qa_cost_usd TEXT NOT NULL DEFAULT '0',
                must_not_reply INTEGER NOT NULL DEFAULT 0,
                is_first_reply INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_conversation ON drafts(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_drafts_stage_status ON drafts(stage, status);
            CREATE INDEX IF NOT EXISTS idx_drafts_updated ON drafts(updated_at);
        "#,
    },
    Migration {
        version: 2,
        name: "learning_loop",
        sql: r#"
            CREATE TABLE IF NOT EXISTS learnings (
                id TEXT PRIMARY KEY,
                draft_id TEXT NOT NULL REFERENCES drafts(id),
                conversation_id TEXT NOT NULL,
                learning_type TEXT NOT NULL,
                original_snippet TEXT NOT NULL,
                corrected_snippet TEXT NOT NULL,
                explanation TEXT NOT NULL,
                confidence REAL NOT NULL,
                stage TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_learnings_draft ON learnings(draft_id);
            CREATE INDEX IF NOT EXISTS idx_learnings_created ON learnings(created_at);

            CREATE TABLE IF NOT EXISTS qa_guidelines (
                id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                guideline_type TEXT NOT NULL,
                content TEXT NOT NULL,
                occurrences INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_reinforced_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_guidelines_stage_active ON qa_guidelines(stage, is_active);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
