//! Draft queue: in-memory review queue with broadcast to the approval surface.
//!
//! Every lifecycle transition is written to the store before the in-memory
//! copy changes, so a failed write leaves both sides as they were.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Draft, DraftEvent, DraftStatus};
use crate::error::DatabaseError;
use crate::store::Database;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Resolved drafts kept in memory once the queue grows past `PRUNE_AT`.
const KEEP_RESOLVED: usize = 100;
const PRUNE_AT: usize = 200;

pub struct DraftQueue {
    drafts: RwLock<VecDeque<Draft>>,
    tx: broadcast::Sender<DraftEvent>,
    db: Arc<dyn Database>,
}

impl DraftQueue {
    pub fn new(db: Arc<dyn Database>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            drafts: RwLock::new(VecDeque::new()),
            tx,
            db,
        })
    }

    /// Subscribe to draft events. Each approval client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<DraftEvent> {
        self.tx.subscribe()
    }

    /// Reload pending and snoozed drafts from the store after a restart.
    /// Returns how many were loaded. Nothing is broadcast.
    pub async fn load_pending(&self) -> Result<usize, DatabaseError> {
        let mut loaded = self.db.list_drafts_by_status(DraftStatus::Pending).await?;
        loaded.extend(self.db.list_drafts_by_status(DraftStatus::Snoozed).await?);

        let mut drafts = self.drafts.write().await;
        let mut count = 0;
        for draft in loaded {
            if !drafts.iter().any(|d| d.id == draft.id) {
                drafts.push_back(draft);
                count += 1;
            }
        }
        info!(count, "Loaded drafts awaiting review");
        Ok(count)
    }

    /// Queue a stored, pending draft and notify subscribers.
    pub async fn push(&self, draft: Draft) {
        info!(
            draft_id = %draft.id,
            lead = %draft.lead_name,
            stage = %draft.stage,
            qa_score = ?draft.qa_score,
            "New draft queued for review"
        );

        let event = DraftEvent::NewDraft {
            draft: Box::new(draft.clone()),
        };
        {
            let mut drafts = self.drafts.write().await;
            // A re-run of the same trigger replaces its earlier draft.
            drafts.retain(|d| d.id != draft.id);
            drafts.push_back(draft);
            if drafts.len() > PRUNE_AT {
                prune_resolved(&mut drafts);
            }
        }

        // No subscribers yet is fine.
        let _ = self.tx.send(event);
    }

    /// Approve as-is.
    pub async fn approve(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        self.transition(id, DraftStatus::Approved, &[DraftStatus::Pending, DraftStatus::Snoozed])
            .await
    }

    /// Record the human's edit and approve it.
    pub async fn edit(&self, id: Uuid, text: &str) -> Result<Option<Draft>, DatabaseError> {
        let mut drafts = self.drafts.write().await;
        let Some(draft) = drafts.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };
        if !matches!(draft.status, DraftStatus::Pending | DraftStatus::Snoozed) {
            warn!(draft_id = %id, status = %draft.status, "Cannot edit resolved draft");
            return Ok(None);
        }

        self.db.record_human_edit(id, text).await?;

        draft.human_edited_text = Some(text.to_string());
        draft.status = DraftStatus::Approved;
        draft.updated_at = Utc::now();
        let edited = draft.clone();

        info!(draft_id = %id, changed = edited.was_edited(), "Draft edited and approved");
        let _ = self.tx.send(DraftEvent::DraftUpdate {
            id,
            status: DraftStatus::Approved,
        });
        Ok(Some(edited))
    }

    pub async fn reject(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        self.transition(id, DraftStatus::Rejected, &[DraftStatus::Pending, DraftStatus::Snoozed])
            .await
    }

    pub async fn snooze(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError> {
        self.transition(id, DraftStatus::Snoozed, &[DraftStatus::Pending])
            .await
    }

    /// Record delivery of an approved draft. `text` defaults to the
    /// effective text (human edit, else AI text).
    pub async fn mark_sent(
        &self,
        id: Uuid,
        text: Option<&str>,
    ) -> Result<Option<Draft>, DatabaseError> {
        let mut drafts = self.drafts.write().await;
        let Some(draft) = drafts.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };
        if draft.status != DraftStatus::Approved {
            warn!(draft_id = %id, status = %draft.status, "Cannot mark unapproved draft as sent");
            return Ok(None);
        }

        let sent = text.unwrap_or(draft.effective_text()).to_string();
        self.db.record_sent_text(id, &sent).await?;

        draft.sent_text = Some(sent);
        draft.status = DraftStatus::Sent;
        draft.updated_at = Utc::now();
        let updated = draft.clone();

        info!(draft_id = %id, "Draft sent");
        let _ = self.tx.send(DraftEvent::DraftUpdate {
            id,
            status: DraftStatus::Sent,
        });
        Ok(Some(updated))
    }

    /// Drafts still awaiting a decision, oldest first.
    pub async fn pending(&self) -> Vec<Draft> {
        self.drafts
            .read()
            .await
            .iter()
            .filter(|d| d.status == DraftStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<Draft> {
        self.drafts.read().await.iter().find(|d| d.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.drafts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.drafts.read().await.is_empty()
    }

    async fn transition(
        &self,
        id: Uuid,
        to: DraftStatus,
        from: &[DraftStatus],
    ) -> Result<Option<Draft>, DatabaseError> {
        let mut drafts = self.drafts.write().await;
        let Some(draft) = drafts.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };
        if !from.contains(&draft.status) {
            debug!(draft_id = %id, status = %draft.status, to = %to, "Ignoring invalid draft transition");
            return Ok(None);
        }

        self.db.update_draft_status(id, to).await?;
        draft.status = to;
        draft.updated_at = Utc::now();
        let updated = draft.clone();

        info!(draft_id = %id, status = %to, "Draft status changed");
        let _ = self.tx.send(DraftEvent::DraftUpdate { id, status: to });
        Ok(Some(updated))
    }
}

/// Drop the oldest resolved drafts, keeping `KEEP_RESOLVED` of them.
fn prune_resolved(drafts: &mut VecDeque<Draft>) {
    let resolved = drafts
        .iter()
        .filter(|d| !matches!(d.status, DraftStatus::Pending | DraftStatus::Snoozed))
        .count();
    let mut to_remove = resolved.saturating_sub(KEEP_RESOLVED);
    if to_remove == 0 {
        return;
    }
    drafts.retain(|d| {
        if to_remove > 0 && !matches!(d.status, DraftStatus::Pending | DraftStatus::Snoozed) {
            to_remove -= 1;
            false
        } else {
            true
        }
    });
}
