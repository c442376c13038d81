//! Draft data model: the persisted reply record, its statuses, and queue events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::judge::DimensionScores;
use crate::pipeline::types::FunnelStage;

/// Lifecycle status of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    /// Waiting for a human decision.
    Pending,
    /// Approved; ready to send.
    Approved,
    /// Rejected by a human, or blocked by QA.
    Rejected,
    /// Set aside for later.
    Snoozed,
    /// The approval surface confirmed delivery.
    Sent,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Snoozed => "snoozed",
            Self::Sent => "sent",
        }
    }
}

impl std::fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DraftStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "snoozed" => Ok(Self::Snoozed),
            "sent" => Ok(Self::Sent),
            _ => Err(format!("Unknown draft status: {}", s)),
        }
    }
}

/// QA gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaVerdict {
    Pass,
    Flag,
    Block,
}

impl QaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Flag => "flag",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for QaVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QaVerdict {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "flag" => Ok(Self::Flag),
            "block" => Ok(Self::Block),
            _ => Err(format!("Unknown QA verdict: {}", s)),
        }
    }
}

/// One problem the QA gate found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub detail: String,
    pub severity: String,
}

/// A drafted reply and everything the pipeline learned while producing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub conversation_id: String,
    pub lead_name: String,
    /// The lead message this draft answers.
    pub lead_message: String,
    /// Final AI text shown to the human.
    pub generated_text: String,
    /// First AI draft, kept when revision or QA replaced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_revision_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_edited_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_text: Option<String>,

    pub stage: FunnelStage,
    pub stage_reasoning: String,

    pub judge_score: Option<f64>,
    pub judge_scores: Option<DimensionScores>,
    pub judge_feedback: Option<String>,
    pub revision_count: u32,

    pub qa_score: Option<f64>,
    pub qa_verdict: Option<QaVerdict>,
    #[serde(default)]
    pub qa_issues: Vec<QaIssue>,
    pub qa_reasoning: Option<String>,
    pub qa_model: Option<String>,
    pub qa_cost_usd: Decimal,
    pub must_not_reply: bool,

    pub is_first_reply: bool,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Draft {
    /// Whether this draft could go out without a human looking at it.
    ///
    /// Never true when QA said not to reply.
    pub fn can_auto_send(&self) -> bool {
        !self.must_not_reply
            && self.status == DraftStatus::Pending
            && self.qa_verdict == Some(QaVerdict::Pass)
    }

    /// Text a human would actually send: their edit if any, else the AI text.
    pub fn effective_text(&self) -> &str {
        self.human_edited_text
            .as_deref()
            .unwrap_or(&self.generated_text)
    }

    /// Whether the human changed the AI text before approving.
    pub fn was_edited(&self) -> bool {
        self.human_edited_text
            .as_deref()
            .is_some_and(|t| t != self.generated_text)
    }
}

/// Events broadcast to approval-surface subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DraftEvent {
    /// A new draft is waiting for review.
    NewDraft { draft: Box<Draft> },
    /// A draft's status changed.
    DraftUpdate { id: Uuid, status: DraftStatus },
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::pipeline::types::{Conversation, LeadContext};
    use crate::store::Database;

    /// A pending draft with sensible defaults for tests.
    pub fn draft(conversation_id: &str, text: &str) -> Draft {
        let now = Utc::now();
        Draft {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            lead_name: "Sam".to_string(),
            lead_message: "sounds interesting, what do you do?".to_string(),
            generated_text: text.to_string(),
            pre_revision_text: None,
            human_edited_text: None,
            sent_text: None,
            stage: FunnelStage::PositiveReply,
            stage_reasoning: "first reply".to_string(),
            judge_score: Some(4.2),
            judge_scores: None,
            judge_feedback: None,
            revision_count: 0,
            qa_score: Some(4.5),
            qa_verdict: Some(QaVerdict::Pass),
            qa_issues: Vec::new(),
            qa_reasoning: None,
            qa_model: None,
            qa_cost_usd: Decimal::ZERO,
            must_not_reply: false,
            is_first_reply: true,
            status: DraftStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// An empty conversation row for drafts to hang off.
    pub fn conversation(id: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: id.to_string(),
            lead_name: "Sam".to_string(),
            history: Vec::new(),
            stage: None,
            lead_context: LeadContext::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Store `draft`, inserting its conversation first when missing.
    pub async fn store(db: &dyn Database, draft: &Draft) {
        if db.get_conversation(&draft.conversation_id).await.unwrap().is_none() {
            db.upsert_conversation(&conversation(&draft.conversation_id))
                .await
                .unwrap();
        }
        db.upsert_draft(draft).await.unwrap();
    }

    /// A pending draft, already persisted.
    pub async fn stored_draft(db: &dyn Database, conversation_id: &str, text: &str) -> Draft {
        let d = draft(conversation_id, text);
        store(db, &d).await;
        d
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::draft;
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            DraftStatus::Pending,
            DraftStatus::Approved,
            DraftStatus::Rejected,
            DraftStatus::Snoozed,
            DraftStatus::Sent,
        ] {
            assert_eq!(status.as_str().parse::<DraftStatus>().unwrap(), status);
        }
        assert!("expired".parse::<DraftStatus>().is_err());
    }

    #[test]
    fn must_not_reply_never_auto_sends() {
        let mut d = draft("c1", "hey");
        assert!(d.can_auto_send());
        d.must_not_reply = true;
        assert!(!d.can_auto_send());
    }

    #[test]
    fn flagged_draft_needs_a_human() {
        let mut d = draft("c1", "hey");
        d.qa_verdict = Some(QaVerdict::Flag);
        assert!(!d.can_auto_send());
        d.qa_verdict = None;
        assert!(!d.can_auto_send());
    }

    #[test]
    fn edit_detection() {
        let mut d = draft("c1", "hey there");
        assert!(!d.was_edited());
        assert_eq!(d.effective_text(), "hey there");
        d.human_edited_text = Some("hey there".into());
        assert!(!d.was_edited());
        d.human_edited_text = Some("hi there".into());
        assert!(d.was_edited());
        assert_eq!(d.effective_text(), "hi there");
    }

    #[test]
    fn qa_issue_uses_type_key() {
        let issue = QaIssue {
            issue_type: "tone".into(),
            detail: "too formal".into(),
            severity: "high".into(),
        };
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["type"], "tone");
    }

    #[test]
    fn event_serde_tag() {
        let d = draft("c1", "hey");
        let json = serde_json::to_string(&DraftEvent::NewDraft { draft: Box::new(d) }).unwrap();
        assert!(json.contains("\"type\":\"new_draft\""));
    }
}
