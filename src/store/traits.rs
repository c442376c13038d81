//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::drafts::model::{Draft, DraftStatus};
use crate::error::DatabaseError;
use crate::learning::model::{Guideline, GuidelineKind, GuidelineScope, Learning};
use crate::pipeline::types::{Conversation, FunnelStage};

/// Backend-agnostic database trait covering conversations, drafts,
/// learnings, and guidelines.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Insert or replace a conversation (keeps the original `created_at`).
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DatabaseError>;

    async fn update_conversation_stage(
        &self,
        id: &str,
        stage: FunnelStage,
    ) -> Result<(), DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    /// Insert or replace a draft keyed by id. Re-running with the same id
    /// overwrites a pending draft and leaves any other status as stored;
    /// it never duplicates.
    async fn upsert_draft(&self, draft: &Draft) -> Result<(), DatabaseError>;

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError>;

    /// Drafts at `stage` with any of `statuses`, newest first.
    async fn list_example_candidates(
        &self,
        stage: FunnelStage,
        statuses: &[DraftStatus],
        limit: usize,
    ) -> Result<Vec<Draft>, DatabaseError>;

    /// Drafts with human-edited text, updated at or after `since`,
    /// that have no learnings yet.
    async fn list_edited_drafts_without_learnings(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Draft>, DatabaseError>;

    /// All drafts with the given status, oldest first.
    async fn list_drafts_by_status(&self, status: DraftStatus)
    -> Result<Vec<Draft>, DatabaseError>;

    async fn update_draft_status(&self, id: Uuid, status: DraftStatus)
    -> Result<(), DatabaseError>;

    /// Record the human's edit of the AI text and mark the draft approved.
    async fn record_human_edit(&self, id: Uuid, text: &str) -> Result<(), DatabaseError>;

    /// Record the text that actually went out and mark the draft sent.
    async fn record_sent_text(&self, id: Uuid, text: &str) -> Result<(), DatabaseError>;

    // ── Learnings ───────────────────────────────────────────────────

    async fn insert_learning(&self, learning: &Learning) -> Result<(), DatabaseError>;

    /// Learnings created at or after `since`, oldest first.
    async fn list_learnings_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Learning>, DatabaseError>;

    async fn draft_has_learnings(&self, draft_id: Uuid) -> Result<bool, DatabaseError>;

    // ── Guidelines ──────────────────────────────────────────────────

    async fn insert_guideline(&self, guideline: &Guideline) -> Result<(), DatabaseError>;

    /// Active guidelines with exactly this scope and kind.
    async fn list_active_guidelines(
        &self,
        scope: GuidelineScope,
        kind: GuidelineKind,
    ) -> Result<Vec<Guideline>, DatabaseError>;

    /// Active guidelines scoped to `stage` or `all`, most reinforced first.
    async fn list_guidelines_for_stage(
        &self,
        stage: FunnelStage,
        limit: usize,
    ) -> Result<Vec<Guideline>, DatabaseError>;

    /// Bump occurrences by one and set `last_reinforced_at`.
    async fn reinforce_guideline(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Deactivate active guidelines last reinforced before `before`.
    /// Returns how many were deactivated.
    async fn deactivate_stale_guidelines(
        &self,
        before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    /// Whether any guideline (active or not) has this scope and content.
    async fn guideline_exists(
        &self,
        scope: GuidelineScope,
        content: &str,
    ) -> Result<bool, DatabaseError>;

    async fn list_guidelines(&self) -> Result<Vec<Guideline>, DatabaseError>;
}
