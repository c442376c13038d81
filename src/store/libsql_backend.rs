//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::drafts::model::{Draft, DraftStatus, QaVerdict};
use crate::error::DatabaseError;
use crate::learning::model::{Guideline, GuidelineKind, GuidelineScope, Learning, LearningType};
use crate::pipeline::types::{Conversation, FunnelStage};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width UTC so TEXT comparison orders correctly.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn row_err(op: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(format!("{op} row parse: {e}"))
}

const CONVERSATION_COLUMNS: &str =
    "id, lead_name, history, funnel_stage, lead_context, created_at, updated_at";

/// Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let op = "conversation";
    let id: String = row.get(0).map_err(|e| row_err(op, e))?;
    let lead_name: String = row.get(1).map_err(|e| row_err(op, e))?;
    let history_str: String = row.get(2).map_err(|e| row_err(op, e))?;
    let stage_str: Option<String> = row.get::<String>(3).ok();
    let context_str: String = row.get(4).map_err(|e| row_err(op, e))?;
    let created_str: String = row.get(5).map_err(|e| row_err(op, e))?;
    let updated_str: String = row.get(6).map_err(|e| row_err(op, e))?;

    let history = serde_json::from_str(&history_str)
        .map_err(|e| DatabaseError::Serialization(format!("conversation history: {e}")))?;
    let lead_context = serde_json::from_str(&context_str)
        .map_err(|e| DatabaseError::Serialization(format!("conversation lead_context: {e}")))?;

    Ok(Conversation {
        id,
        lead_name,
        history,
        stage: stage_str.and_then(|s| s.parse().ok()),
        lead_context,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const DRAFT_COLUMNS: &str = "id, conversation_id, lead_name, lead_message, generated_text, \
    pre_revision_text, human_edited_text, sent_text, stage, stage_reasoning, \
    judge_score, judge_scores, judge_feedback, revision_count, \
    qa_score, qa_verdict, qa_issues, qa_reasoning, qa_model, qa_cost_usd, must_not_reply, \
    is_first_reply, status, created_at, updated_at";

/// Column order matches DRAFT_COLUMNS.
fn row_to_draft(row: &libsql::Row) -> Result<Draft, DatabaseError> {
    let op = "draft";
    let id_str: String = row.get(0).map_err(|e| row_err(op, e))?;
    let stage_str: String = row.get(8).map_err(|e| row_err(op, e))?;
    let status_str: String = row.get(22).map_err(|e| row_err(op, e))?;

    let judge_scores = row
        .get::<String>(11)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());
    let qa_issues = row
        .get::<String>(16)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let qa_cost_usd = row
        .get::<String>(19)
        .ok()
        .and_then(|s| Decimal::from_str(&s).ok())
        .unwrap_or(Decimal::ZERO);
    let created_str: String = row.get(23).map_err(|e| row_err(op, e))?;
    let updated_str: String = row.get(24).map_err(|e| row_err(op, e))?;

    Ok(Draft {
        id: Uuid::parse_str(&id_str).map_err(|e| row_err(op, e))?,
        conversation_id: row.get(1).map_err(|e| row_err(op, e))?,
        lead_name: row.get(2).map_err(|e| row_err(op, e))?,
        lead_message: row.get(3).map_err(|e| row_err(op, e))?,
        generated_text: row.get(4).map_err(|e| row_err(op, e))?,
        pre_revision_text: row.get::<String>(5).ok(),
        human_edited_text: row.get::<String>(6).ok(),
        sent_text: row.get::<String>(7).ok(),
        stage: FunnelStage::from_str(&stage_str).map_err(|e| row_err(op, e))?,
        stage_reasoning: row.get::<String>(9).unwrap_or_default(),
        judge_score: row.get::<f64>(10).ok(),
        judge_scores,
        judge_feedback: row.get::<String>(12).ok(),
        revision_count: row.get::<i64>(13).unwrap_or(0).max(0) as u32,
        qa_score: row.get::<f64>(14).ok(),
        qa_verdict: row
            .get::<String>(15)
            .ok()
            .and_then(|s| s.parse::<QaVerdict>().ok()),
        qa_issues,
        qa_reasoning: row.get::<String>(17).ok(),
        qa_model: row.get::<String>(18).ok(),
        qa_cost_usd,
        must_not_reply: row.get::<i64>(20).unwrap_or(0) != 0,
        is_first_reply: row.get::<i64>(21).unwrap_or(0) != 0,
        status: status_str.parse().map_err(|e: String| row_err(op, e))?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const LEARNING_COLUMNS: &str = "id, draft_id, conversation_id, learning_type, original_snippet, \
    corrected_snippet, explanation, confidence, stage, created_at";

fn row_to_learning(row: &libsql::Row) -> Result<Learning, DatabaseError> {
    let op = "learning";
    let id_str: String = row.get(0).map_err(|e| row_err(op, e))?;
    let draft_str: String = row.get(1).map_err(|e| row_err(op, e))?;
    let type_str: String = row.get(3).map_err(|e| row_err(op, e))?;
    let stage_str: String = row.get(8).map_err(|e| row_err(op, e))?;
    let created_str: String = row.get(9).map_err(|e| row_err(op, e))?;

    Ok(Learning {
        id: Uuid::parse_str(&id_str).map_err(|e| row_err(op, e))?,
        draft_id: Uuid::parse_str(&draft_str).map_err(|e| row_err(op, e))?,
        conversation_id: row.get(2).map_err(|e| row_err(op, e))?,
        learning_type: LearningType::from_str(&type_str).map_err(|e| row_err(op, e))?,
        original_snippet: row.get(4).map_err(|e| row_err(op, e))?,
        corrected_snippet: row.get(5).map_err(|e| row_err(op, e))?,
        explanation: row.get(6).map_err(|e| row_err(op, e))?,
        confidence: row.get::<f64>(7).unwrap_or(0.0),
        stage: FunnelStage::from_str(&stage_str).map_err(|e| row_err(op, e))?,
        created_at: parse_datetime(&created_str),
    })
}

const GUIDELINE_COLUMNS: &str =
    "id, stage, guideline_type, content, occurrences, is_active, last_reinforced_at, created_at";

fn row_to_guideline(row: &libsql::Row) -> Result<Guideline, DatabaseError> {
    let op = "guideline";
    let id_str: String = row.get(0).map_err(|e| row_err(op, e))?;
    let scope_str: String = row.get(1).map_err(|e| row_err(op, e))?;
    let kind_str: String = row.get(2).map_err(|e| row_err(op, e))?;
    let reinforced_str: String = row.get(6).map_err(|e| row_err(op, e))?;
    let created_str: String = row.get(7).map_err(|e| row_err(op, e))?;

    Ok(Guideline {
        id: Uuid::parse_str(&id_str).map_err(|e| row_err(op, e))?,
        scope: GuidelineScope::from_str(&scope_str).map_err(|e| row_err(op, e))?,
        kind: GuidelineKind::from_str(&kind_str).map_err(|e| row_err(op, e))?,
        content: row.get(3).map_err(|e| row_err(op, e))?,
        occurrences: row.get::<i64>(4).unwrap_or(0).max(0) as u32,
        is_active: row.get::<i64>(5).unwrap_or(0) != 0,
        last_reinforced_at: parse_datetime(&reinforced_str),
        created_at: parse_datetime(&created_str),
    })
}

/// Drain rows through `map`, skipping (and logging) rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => warn!("Skipping row: {e}"),
        }
    }
    out
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversations (id, lead_name, history, funnel_stage, lead_context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    lead_name = excluded.lead_name,
                    history = excluded.history,
                    funnel_stage = COALESCE(excluded.funnel_stage, conversations.funnel_stage),
                    lead_context = excluded.lead_context,
                    updated_at = excluded.updated_at",
                params![
                    conversation.id.as_str(),
                    conversation.lead_name.as_str(),
                    to_json(&conversation.history)?,
                    opt_text(conversation.stage.map(|s| s.as_str())),
                    to_json(&conversation.lead_context)?,
                    fmt_ts(conversation.created_at),
                    fmt_ts(conversation.updated_at),
                ],
            )
            .await
            .map_err(query_err("upsert_conversation"))?;

        debug!(conversation_id = %conversation.id, "Conversation upserted");
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_conversation"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn update_conversation_stage(
        &self,
        id: &str,
        stage: FunnelStage,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE conversations SET funnel_stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![stage.as_str(), fmt_ts(Utc::now()), id],
            )
            .await
            .map_err(query_err("update_conversation_stage"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: id.to_string(),
            });
        }
        debug!(conversation_id = %id, stage = %stage, "Conversation stage updated");
        Ok(())
    }

    // ── Drafts ──────────────────────────────────────────────────────

    async fn upsert_draft(&self, draft: &Draft) -> Result<(), DatabaseError> {
        let judge_scores = match &draft.judge_scores {
            Some(scores) => Some(to_json(scores)?),
            None => None,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO drafts ({DRAFT_COLUMNS}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
                     ON CONFLICT(id) DO UPDATE SET
                        conversation_id = excluded.conversation_id,
                        lead_name = excluded.lead_name,
                        lead_message = excluded.lead_message,
                        generated_text = excluded.generated_text,
                        pre_revision_text = excluded.pre_revision_text,
                        human_edited_text = excluded.human_edited_text,
                        sent_text = excluded.sent_text,
                        stage = excluded.stage,
                        stage_reasoning = excluded.stage_reasoning,
                        judge_score = excluded.judge_score,
                        judge_scores = excluded.judge_scores,
                        judge_feedback = excluded.judge_feedback,
                        revision_count = excluded.revision_count,
                        qa_score = excluded.qa_score,
                        qa_verdict = excluded.qa_verdict,
                        qa_issues = excluded.qa_issues,
                        qa_reasoning = excluded.qa_reasoning,
                        qa_model = excluded.qa_model,
                        qa_cost_usd = excluded.qa_cost_usd,
                        must_not_reply = excluded.must_not_reply,
                        is_first_reply = excluded.is_first_reply,
                        status = excluded.status,
                        updated_at = excluded.updated_at
                     WHERE drafts.status = 'pending'"
                ),
                params![
                    draft.id.to_string(),
                    draft.conversation_id.as_str(),
                    draft.lead_name.as_str(),
                    draft.lead_message.as_str(),
                    draft.generated_text.as_str(),
                    opt_text(draft.pre_revision_text.as_deref()),
                    opt_text(draft.human_edited_text.as_deref()),
                    opt_text(draft.sent_text.as_deref()),
                    draft.stage.as_str(),
                    draft.stage_reasoning.as_str(),
                    opt_real(draft.judge_score),
                    opt_text(judge_scores.as_deref()),
                    opt_text(draft.judge_feedback.as_deref()),
                    draft.revision_count as i64,
                    opt_real(draft.qa_score),
                    opt_text(draft.qa_verdict.map(|v| v.as_str())),
                    to_json(&draft.qa_issues)?,
                    opt_text(draft.qa_reasoning.as_deref()),
                    opt_text(draft.qa_model.as_deref()),
                    draft.qa_cost_usd.to_string(),
                    draft.must_not_reply as i64,
                    draft.is_first_reply as i64,
                    draft.status.as_str(),
                    fmt_ts(draft.created_at),
                    fmt_ts(draft.updated_at),
                ],
            )
            .await
            .map_err(query_err("upsert_draft"))?;

        debug!(draft_id = %draft.id, status = %draft.status, "Draft upserted");
        Ok(())
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_draft"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_draft(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_draft: {e}"))),
        }
    }

    async fn list_example_candidates(
        &self,
        stage: FunnelStage,
        statuses: &[DraftStatus],
        limit: usize,
    ) -> Result<Vec<Draft>, DatabaseError> {
        if statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        // Status strings are fixed identifiers, safe to inline.
        let status_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts
                     WHERE stage = ?1 AND status IN ({status_list})
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![stage.as_str(), limit as i64],
            )
            .await
            .map_err(query_err("list_example_candidates"))?;

        Ok(collect_rows(rows, row_to_draft).await)
    }

    async fn list_edited_drafts_without_learnings(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Draft>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts
                     WHERE human_edited_text IS NOT NULL
                       AND updated_at >= ?1
                       AND NOT EXISTS (SELECT 1 FROM learnings l WHERE l.draft_id = drafts.id)
                     ORDER BY updated_at ASC"
                ),
                params![fmt_ts(since)],
            )
            .await
            .map_err(query_err("list_edited_drafts_without_learnings"))?;

        Ok(collect_rows(rows, row_to_draft).await)
    }

    async fn list_drafts_by_status(
        &self,
        status: DraftStatus,
    ) -> Result<Vec<Draft>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts WHERE status = ?1 ORDER BY created_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(query_err("list_drafts_by_status"))?;

        Ok(collect_rows(rows, row_to_draft).await)
    }

    async fn update_draft_status(
        &self,
        id: Uuid,
        status: DraftStatus,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE drafts SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("update_draft_status"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "draft".to_string(),
                id: id.to_string(),
            });
        }
        debug!(draft_id = %id, status = %status, "Draft status updated");
        Ok(())
    }

    async fn record_human_edit(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE drafts SET human_edited_text = ?1, status = 'approved', updated_at = ?2 WHERE id = ?3",
                params![text, fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("record_human_edit"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "draft".to_string(),
                id: id.to_string(),
            });
        }
        debug!(draft_id = %id, "Human edit recorded, draft approved");
        Ok(())
    }

    async fn record_sent_text(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE drafts SET sent_text = ?1, status = 'sent', updated_at = ?2 WHERE id = ?3",
                params![text, fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("record_sent_text"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "draft".to_string(),
                id: id.to_string(),
            });
        }
        debug!(draft_id = %id, "Sent text recorded");
        Ok(())
    }

    // ── Learnings ───────────────────────────────────────────────────

    async fn insert_learning(&self, learning: &Learning) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO learnings ({LEARNING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    learning.id.to_string(),
                    learning.draft_id.to_string(),
                    learning.conversation_id.as_str(),
                    learning.learning_type.as_str(),
                    learning.original_snippet.as_str(),
                    learning.corrected_snippet.as_str(),
                    learning.explanation.as_str(),
                    learning.confidence,
                    learning.stage.as_str(),
                    fmt_ts(learning.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_learning"))?;
        Ok(())
    }

    async fn list_learnings_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Learning>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEARNING_COLUMNS} FROM learnings WHERE created_at >= ?1 ORDER BY created_at ASC"
                ),
                params![fmt_ts(since)],
            )
            .await
            .map_err(query_err("list_learnings_since"))?;

        Ok(collect_rows(rows, row_to_learning).await)
    }

    async fn draft_has_learnings(&self, draft_id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM learnings WHERE draft_id = ?1",
                params![draft_id.to_string()],
            )
            .await
            .map_err(query_err("draft_has_learnings"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("draft_has_learnings: {e}"))),
        }
    }

    // ── Guidelines ──────────────────────────────────────────────────

    async fn insert_guideline(&self, guideline: &Guideline) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO qa_guidelines ({GUIDELINE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    guideline.id.to_string(),
                    guideline.scope.as_str(),
                    guideline.kind.as_str(),
                    guideline.content.as_str(),
                    guideline.occurrences as i64,
                    guideline.is_active as i64,
                    fmt_ts(guideline.last_reinforced_at),
                    fmt_ts(guideline.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_guideline"))?;

        debug!(guideline_id = %guideline.id, scope = %guideline.scope, kind = %guideline.kind, "Guideline inserted");
        Ok(())
    }

    async fn list_active_guidelines(
        &self,
        scope: GuidelineScope,
        kind: GuidelineKind,
    ) -> Result<Vec<Guideline>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GUIDELINE_COLUMNS} FROM qa_guidelines
                     WHERE stage = ?1 AND guideline_type = ?2 AND is_active = 1
                     ORDER BY occurrences DESC"
                ),
                params![scope.as_str(), kind.as_str()],
            )
            .await
            .map_err(query_err("list_active_guidelines"))?;

        Ok(collect_rows(rows, row_to_guideline).await)
    }

    async fn list_guidelines_for_stage(
        &self,
        stage: FunnelStage,
        limit: usize,
    ) -> Result<Vec<Guideline>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GUIDELINE_COLUMNS} FROM qa_guidelines
                     WHERE is_active = 1 AND (stage = ?1 OR stage = 'all')
                     ORDER BY occurrences DESC, last_reinforced_at DESC
                     LIMIT ?2"
                ),
                params![stage.as_str(), limit as i64],
            )
            .await
            .map_err(query_err("list_guidelines_for_stage"))?;

        Ok(collect_rows(rows, row_to_guideline).await)
    }

    async fn reinforce_guideline(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE qa_guidelines SET occurrences = occurrences + 1, last_reinforced_at = ?1 WHERE id = ?2",
                params![fmt_ts(at), id.to_string()],
            )
            .await
            .map_err(query_err("reinforce_guideline"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "guideline".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn deactivate_stale_guidelines(
        &self,
        before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE qa_guidelines SET is_active = 0 WHERE is_active = 1 AND last_reinforced_at < ?1",
                params![fmt_ts(before)],
            )
            .await
            .map_err(query_err("deactivate_stale_guidelines"))?;
        Ok(changed as usize)
    }

    async fn guideline_exists(
        &self,
        scope: GuidelineScope,
        content: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM qa_guidelines WHERE stage = ?1 AND content = ?2",
                params![scope.as_str(), content],
            )
            .await
            .map_err(query_err("guideline_exists"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("guideline_exists: {e}"))),
        }
    }

    async fn list_guidelines(&self) -> Result<Vec<Guideline>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GUIDELINE_COLUMNS} FROM qa_guidelines ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(query_err("list_guidelines"))?;

        Ok(collect_rows(rows, row_to_guideline).await)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::model::{QaIssue, fixtures};
    use crate::pipeline::judge::DimensionScores;
    use crate::pipeline::types::{HistoryMessage, LeadContext};
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_conversation(id: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: id.to_string(),
            lead_name: "Sam".to_string(),
            history: vec![
                HistoryMessage::assistant("saw your post on hiring"),
                HistoryMessage::lead("thanks! what do you do?"),
            ],
            stage: None,
            lead_context: LeadContext {
                company: Some("Acme".into()),
                is_first_reply: true,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    async fn seeded_draft(db: &LibSqlBackend, conv: &str, text: &str) -> Draft {
        if db.get_conversation(conv).await.unwrap().is_none() {
            db.upsert_conversation(&make_conversation(conv)).await.unwrap();
        }
        let draft = fixtures::draft(conv, text);
        db.upsert_draft(&draft).await.unwrap();
        draft
    }

    fn make_learning(draft: &Draft, at: DateTime<Utc>) -> Learning {
        Learning {
            id: Uuid::new_v4(),
            draft_id: draft.id,
            conversation_id: draft.conversation_id.clone(),
            learning_type: LearningType::Tone,
            original_snippet: "I'd love to".into(),
            corrected_snippet: "happy to".into(),
            explanation: "less eager".into(),
            confidence: 0.8,
            stage: draft.stage,
            created_at: at,
        }
    }

    // ── Conversation tests ──────────────────────────────────────────

    #[tokio::test]
    async fn conversation_roundtrip_and_stage_update() {
        let db = test_db().await;
        let conv = make_conversation("c1");
        db.upsert_conversation(&conv).await.unwrap();

        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.history.len(), 2);
        assert_eq!(fetched.lead_context.company.as_deref(), Some("Acme"));
        assert!(fetched.stage.is_none());

        db.update_conversation_stage("c1", FunnelStage::Pitched)
            .await
            .unwrap();
        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.stage, Some(FunnelStage::Pitched));
    }

    #[tokio::test]
    async fn conversation_upsert_keeps_known_stage() {
        let db = test_db().await;
        let mut conv = make_conversation("c1");
        conv.stage = Some(FunnelStage::Booked);
        db.upsert_conversation(&conv).await.unwrap();

        conv.stage = None;
        conv.history.push(HistoryMessage::lead("see you then"));
        db.upsert_conversation(&conv).await.unwrap();

        let fetched = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(fetched.stage, Some(FunnelStage::Booked));
        assert_eq!(fetched.history.len(), 3);
    }

    #[tokio::test]
    async fn stage_update_on_missing_conversation_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_conversation_stage("nope", FunnelStage::Booked)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Draft tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn draft_roundtrip_preserves_qc_fields() {
        let db = test_db().await;
        db.upsert_conversation(&make_conversation("c1")).await.unwrap();

        let mut draft = fixtures::draft("c1", "hey Sam, we help founders get clients on LinkedIn");
        draft.judge_scores = Some(DimensionScores {
            contextual_relevance: 5.0,
            personalization: 4.0,
            tone: 3.0,
            cta_quality: 2.0,
            authenticity: 1.0,
        });
        draft.qa_issues = vec![QaIssue {
            issue_type: "tone".into(),
            detail: "a bit stiff".into(),
            severity: "low".into(),
        }];
        draft.qa_verdict = Some(QaVerdict::Flag);
        draft.qa_cost_usd = dec!(0.0123);
        draft.pre_revision_text = Some("first try".into());
        draft.revision_count = 1;
        db.upsert_draft(&draft).await.unwrap();

        let fetched = db.get_draft(draft.id).await.unwrap().unwrap();
        assert_eq!(fetched.generated_text, draft.generated_text);
        assert_eq!(fetched.judge_scores.unwrap().tone, 3.0);
        assert_eq!(fetched.qa_issues.len(), 1);
        assert_eq!(fetched.qa_verdict, Some(QaVerdict::Flag));
        assert_eq!(fetched.qa_cost_usd, dec!(0.0123));
        assert_eq!(fetched.pre_revision_text.as_deref(), Some("first try"));
        assert_eq!(fetched.revision_count, 1);
        assert!(fetched.is_first_reply);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_id() {
        let db = test_db().await;
        let mut draft = seeded_draft(&db, "c1", "v1").await;
        draft.generated_text = "v2".into();
        db.upsert_draft(&draft).await.unwrap();
        db.upsert_draft(&draft).await.unwrap();

        let pending = db.list_drafts_by_status(DraftStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].generated_text, "v2");
    }

    #[tokio::test]
    async fn upsert_never_overwrites_resolved_draft() {
        let db = test_db().await;
        let mut draft = seeded_draft(&db, "c1", "v1").await;
        db.record_human_edit(draft.id, "edited").await.unwrap();

        draft.generated_text = "v2".into();
        db.upsert_draft(&draft).await.unwrap();

        let fetched = db.get_draft(draft.id).await.unwrap().unwrap();
        assert_eq!(fetched.generated_text, "v1");
        assert_eq!(fetched.status, DraftStatus::Approved);
        assert_eq!(fetched.human_edited_text.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn get_draft_not_found() {
        let db = test_db().await;
        assert!(db.get_draft(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn example_candidates_filter_stage_and_status_newest_first() {
        let db = test_db().await;
        db.upsert_conversation(&make_conversation("c1")).await.unwrap();

        let base = Utc::now() - chrono::Duration::hours(1);
        for (i, status) in [DraftStatus::Approved, DraftStatus::Sent, DraftStatus::Rejected]
            .into_iter()
            .enumerate()
        {
            let mut d = fixtures::draft("c1", &format!("reply {i}"));
            d.status = status;
            d.created_at = base + chrono::Duration::minutes(i as i64);
            db.upsert_draft(&d).await.unwrap();
        }
        let mut other_stage = fixtures::draft("c1", "booked reply");
        other_stage.stage = FunnelStage::Booked;
        other_stage.status = DraftStatus::Approved;
        db.upsert_draft(&other_stage).await.unwrap();

        let got = db
            .list_example_candidates(
                FunnelStage::PositiveReply,
                &[DraftStatus::Approved, DraftStatus::Sent],
                10,
            )
            .await
            .unwrap();
        let texts: Vec<_> = got.iter().map(|d| d.generated_text.as_str()).collect();
        assert_eq!(texts, vec!["reply 1", "reply 0"]);

        let limited = db
            .list_example_candidates(
                FunnelStage::PositiveReply,
                &[DraftStatus::Approved, DraftStatus::Sent],
                1,
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn status_edit_and_sent_updates() {
        let db = test_db().await;
        let draft = seeded_draft(&db, "c1", "hello").await;

        // One write stores the edit and the approval.
        db.record_human_edit(draft.id, "hello!").await.unwrap();
        let fetched = db.get_draft(draft.id).await.unwrap().unwrap();
        assert_eq!(fetched.human_edited_text.as_deref(), Some("hello!"));
        assert_eq!(fetched.status, DraftStatus::Approved);

        db.record_sent_text(draft.id, "hello!").await.unwrap();
        let fetched = db.get_draft(draft.id).await.unwrap().unwrap();
        assert_eq!(fetched.sent_text.as_deref(), Some("hello!"));
        assert_eq!(fetched.status, DraftStatus::Sent);
    }

    #[tokio::test]
    async fn status_update_missing_draft_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_draft_status(Uuid::new_v4(), DraftStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn edited_drafts_exclude_mined_ones() {
        let db = test_db().await;
        let a = seeded_draft(&db, "c1", "a").await;
        let b = seeded_draft(&db, "c1", "b").await;
        let _unedited = seeded_draft(&db, "c1", "c").await;
        db.record_human_edit(a.id, "A").await.unwrap();
        db.record_human_edit(b.id, "B").await.unwrap();
        db.insert_learning(&make_learning(&b, Utc::now())).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(24);
        let edited = db.list_edited_drafts_without_learnings(since).await.unwrap();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].id, a.id);

        assert!(db.draft_has_learnings(b.id).await.unwrap());
        assert!(!db.draft_has_learnings(a.id).await.unwrap());
    }

    // ── Learning tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn learnings_since_window() {
        let db = test_db().await;
        let d = seeded_draft(&db, "c1", "x").await;
        db.insert_learning(&make_learning(&d, Utc::now() - chrono::Duration::days(10)))
            .await
            .unwrap();
        db.insert_learning(&make_learning(&d, Utc::now() - chrono::Duration::days(1)))
            .await
            .unwrap();

        let recent = db
            .list_learnings_since(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].learning_type, LearningType::Tone);
        assert_eq!(recent[0].conversation_id, "c1");
    }

    // ── Guideline tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn guidelines_for_stage_include_all_scope_ordered_and_limited() {
        let db = test_db().await;
        let a = Guideline::new(GuidelineScope::All, GuidelineKind::Do, "all-scope", 5);
        let b = Guideline::new(
            GuidelineScope::Stage(FunnelStage::Pitched),
            GuidelineKind::Dont,
            "pitched-scope",
            9,
        );
        let c = Guideline::new(
            GuidelineScope::Stage(FunnelStage::Booked),
            GuidelineKind::Do,
            "other stage",
            20,
        );
        let mut inactive = Guideline::new(GuidelineScope::All, GuidelineKind::Do, "inactive", 50);
        inactive.is_active = false;
        for g in [&a, &b, &c, &inactive] {
            db.insert_guideline(g).await.unwrap();
        }

        let got = db
            .list_guidelines_for_stage(FunnelStage::Pitched, 15)
            .await
            .unwrap();
        let contents: Vec<_> = got.iter().map(|g| g.content.as_str()).collect();
        assert_eq!(contents, vec!["pitched-scope", "all-scope"]);

        let one = db
            .list_guidelines_for_stage(FunnelStage::Pitched, 1)
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn reinforce_and_prune() {
        let db = test_db().await;
        let mut stale = Guideline::new(GuidelineScope::All, GuidelineKind::Do, "old rule", 3);
        stale.last_reinforced_at = Utc::now() - chrono::Duration::days(31);
        let fresh = Guideline::new(GuidelineScope::All, GuidelineKind::Do, "new rule", 3);
        db.insert_guideline(&stale).await.unwrap();
        db.insert_guideline(&fresh).await.unwrap();

        let now = Utc::now();
        db.reinforce_guideline(fresh.id, now).await.unwrap();

        let pruned = db
            .deactivate_stale_guidelines(now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let active = db
            .list_active_guidelines(GuidelineScope::All, GuidelineKind::Do)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].content, "new rule");
        assert_eq!(active[0].occurrences, 4);

        // Pruned guidelines still exist, so seeding won't resurrect them.
        assert!(
            db.guideline_exists(GuidelineScope::All, "old rule")
                .await
                .unwrap()
        );
        assert_eq!(db.list_guidelines().await.unwrap().len(), 2);
    }
}
