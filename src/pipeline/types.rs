//! Shared types for the reply pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ── Funnel stage ────────────────────────────────────────────────────

/// Where a conversation sits in the outreach funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    /// We messaged first and they haven't engaged yet.
    Initiated,
    /// First positive response from the lead.
    PositiveReply,
    /// We've explained the offer.
    Pitched,
    /// A booking link has been shared.
    CalendarSent,
    /// A call is on the calendar.
    Booked,
    /// Went cold; trying to re-engage.
    Regeneration,
}

impl FunnelStage {
    pub const ALL: [FunnelStage; 6] = [
        FunnelStage::Initiated,
        FunnelStage::PositiveReply,
        FunnelStage::Pitched,
        FunnelStage::CalendarSent,
        FunnelStage::Booked,
        FunnelStage::Regeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::PositiveReply => "positive_reply",
            Self::Pitched => "pitched",
            Self::CalendarSent => "calendar_sent",
            Self::Booked => "booked",
            Self::Regeneration => "regeneration",
        }
    }
}

impl fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunnelStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "initiated" => Ok(Self::Initiated),
            "positive_reply" => Ok(Self::PositiveReply),
            "pitched" => Ok(Self::Pitched),
            "calendar_sent" => Ok(Self::CalendarSent),
            "booked" => Ok(Self::Booked),
            "regeneration" => Ok(Self::Regeneration),
            _ => Err(PipelineError::UnknownStage(s.to_string())),
        }
    }
}

// ── Conversation ────────────────────────────────────────────────────

/// Who wrote a history message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    Lead,
    /// Us (the account the drafts are written for).
    #[serde(alias = "you")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
    /// Display timestamp, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl HistoryMessage {
    pub fn lead(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Lead,
            content: content.into(),
            time: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Assistant,
            content: content.into(),
            time: None,
        }
    }
}

/// What we know about the lead beyond the message thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadContext {
    pub company: Option<String>,
    pub title: Option<String>,
    /// Our last message to them, the one they are replying to.
    pub triggering_message: Option<String>,
    /// The original outreach text.
    pub personalized_message: Option<String>,
    /// True when this is the lead's first reply in the thread.
    pub is_first_reply: bool,
}

/// A stored conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub lead_name: String,
    pub history: Vec<HistoryMessage>,
    pub stage: Option<FunnelStage>,
    pub lead_context: LeadContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Most recent message the lead sent, if any.
    pub fn last_lead_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == HistoryRole::Lead)
            .map(|m| m.content.as_str())
    }
}

// ── Inbound trigger ─────────────────────────────────────────────────

/// One unit of work: a lead just replied and needs a drafted answer.
///
/// `history` holds the thread *before* `latest_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundTrigger {
    pub conversation_id: String,
    pub lead_name: String,
    pub latest_message: String,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub lead_context: LeadContext,
}

impl InboundTrigger {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.conversation_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "conversation_id is empty".to_string(),
            ));
        }
        if self.latest_message.trim().is_empty() {
            return Err(PipelineError::Validation(
                "latest_message is empty".to_string(),
            ));
        }
        Ok(())
    }
}
