//! Learning and guideline records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::types::FunnelStage;

/// What kind of correction a human edit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    Tone,
    Content,
    Structure,
    /// The lead signalled we should not reply at all.
    #[serde(alias = "skip_detection")]
    StopSignal,
    ProductKnowledge,
}

impl LearningType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tone => "tone",
            Self::Content => "content",
            Self::Structure => "structure",
            Self::StopSignal => "stop_signal",
            Self::ProductKnowledge => "product_knowledge",
        }
    }
}

impl fmt::Display for LearningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LearningType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tone" => Ok(Self::Tone),
            "content" => Ok(Self::Content),
            "structure" => Ok(Self::Structure),
            "stop_signal" | "skip_detection" => Ok(Self::StopSignal),
            "product_knowledge" => Ok(Self::ProductKnowledge),
            other => Err(format!("Unknown learning type: {}", other)),
        }
    }
}

/// One observation mined from a human edit. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: Uuid,
    pub draft_id: Uuid,
    pub conversation_id: String,
    pub learning_type: LearningType,
    pub original_snippet: String,
    pub corrected_snippet: String,
    pub explanation: String,
    /// In [0, 1].
    pub confidence: f64,
    pub stage: FunnelStage,
    pub created_at: DateTime<Utc>,
}

/// Kind of rule a guideline expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidelineKind {
    Do,
    Dont,
    Example,
    ToneRule,
}

impl GuidelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Do => "do",
            Self::Dont => "dont",
            Self::Example => "example",
            Self::ToneRule => "tone_rule",
        }
    }
}

impl fmt::Display for GuidelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuidelineKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "do" => Ok(Self::Do),
            "dont" | "don't" => Ok(Self::Dont),
            "example" => Ok(Self::Example),
            "tone_rule" => Ok(Self::ToneRule),
            other => Err(format!("Unknown guideline kind: {}", other)),
        }
    }
}

/// Which stages a guideline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuidelineScope {
    All,
    Stage(FunnelStage),
}

impl GuidelineScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Stage(stage) => stage.as_str(),
        }
    }

    /// Whether a guideline with this scope applies at `stage`.
    pub fn covers(&self, stage: FunnelStage) -> bool {
        match self {
            Self::All => true,
            Self::Stage(s) => *s == stage,
        }
    }
}

impl fmt::Display for GuidelineScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuidelineScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse::<FunnelStage>()
            .map(Self::Stage)
            .map_err(|_| format!("Unknown guideline scope: {}", s))
    }
}

impl Serialize for GuidelineScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GuidelineScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A consolidated rule fed back into the QA gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guideline {
    pub id: Uuid,
    pub scope: GuidelineScope,
    pub kind: GuidelineKind,
    pub content: String,
    pub occurrences: u32,
    pub is_active: bool,
    pub last_reinforced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Guideline {
    pub fn new(
        scope: GuidelineScope,
        kind: GuidelineKind,
        content: impl Into<String>,
        occurrences: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope,
            kind,
            content: content.into(),
            occurrences,
            is_active: true,
            last_reinforced_at: now,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_detection_is_an_alias() {
        assert_eq!(
            "skip_detection".parse::<LearningType>().unwrap(),
            LearningType::StopSignal
        );
        let t: LearningType = serde_json::from_str("\"skip_detection\"").unwrap();
        assert_eq!(t, LearningType::StopSignal);
        assert_eq!(LearningType::StopSignal.as_str(), "stop_signal");
    }

    #[test]
    fn unknown_learning_type() {
        assert!("grammar".parse::<LearningType>().is_err());
    }

    #[test]
    fn scope_parse_and_cover() {
        let all: GuidelineScope = "all".parse().unwrap();
        assert!(all.covers(FunnelStage::Booked));

        let pitched: GuidelineScope = "pitched".parse().unwrap();
        assert_eq!(pitched, GuidelineScope::Stage(FunnelStage::Pitched));
        assert!(pitched.covers(FunnelStage::Pitched));
        assert!(!pitched.covers(FunnelStage::Booked));

        assert!("nowhere".parse::<GuidelineScope>().is_err());
    }

    #[test]
    fn scope_serializes_as_string() {
        let json = serde_json::to_string(&GuidelineScope::Stage(FunnelStage::CalendarSent)).unwrap();
        assert_eq!(json, "\"calendar_sent\"");
        let back: GuidelineScope = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(back, GuidelineScope::All);
    }

    #[test]
    fn new_guideline_is_active() {
        let g = Guideline::new(GuidelineScope::All, GuidelineKind::Dont, "no pitching", 3);
        assert!(g.is_active);
        assert_eq!(g.occurrences, 3);
        assert_eq!(g.last_reinforced_at, g.created_at);
    }
}
