//! Learning miner: diffs human-edited drafts against the AI text and asks
//! the review model what changed and why.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::drafts::model::Draft;
use crate::error::{DatabaseError, PipelineError};
use crate::learning::model::{Learning, LearningType};
use crate::llm::{Gateway, GenerationParams};
use crate::pipeline::prompts::history_section;
use crate::store::Database;

const MINER_PARAMS: GenerationParams = GenerationParams::new(0.2, 800);

/// History messages shown to the model for context.
const CONTEXT_MESSAGES: usize = 5;

/// Fallback snippet length when the model omits one.
const SNIPPET_FALLBACK_CHARS: usize = 200;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("static pattern"));

/// Counts from one mining run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiningReport {
    pub drafts_analyzed: usize,
    pub learnings_created: usize,
    pub failures: usize,
    pub trivial_skipped: usize,
}

#[derive(Debug, Deserialize)]
struct RawLearnings {
    #[serde(default)]
    learnings: Vec<RawLearning>,
}

#[derive(Debug, Deserialize)]
struct RawLearning {
    #[serde(rename = "type")]
    learning_type: String,
    #[serde(default)]
    original_snippet: Option<String>,
    #[serde(default)]
    corrected_snippet: Option<String>,
    #[serde(default)]
    explanation: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Case, whitespace, and punctuation folded away.
fn normalize(text: &str) -> String {
    PUNCTUATION
        .replace_all(&text.to_lowercase(), "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether an edit changes nothing but case, whitespace, or punctuation.
pub fn is_trivial_edit(original: &str, edited: &str) -> bool {
    normalize(original) == normalize(edited)
}

pub struct LearningMiner {
    gateway: Gateway,
    db: Arc<dyn Database>,
    lookback: chrono::Duration,
}

impl LearningMiner {
    pub fn new(gateway: Gateway, db: Arc<dyn Database>, lookback: chrono::Duration) -> Self {
        Self {
            gateway,
            db,
            lookback,
        }
    }

    /// Mine every edited draft in the look-back window that has no
    /// learnings yet. Per-draft failures are counted, never raised.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<MiningReport, DatabaseError> {
        let since = now - self.lookback;
        let drafts = self.db.list_edited_drafts_without_learnings(since).await?;
        let mut report = MiningReport::default();

        if drafts.is_empty() {
            info!("No edited drafts to mine");
            return Ok(report);
        }

        for draft in drafts {
            let Some(edited) = draft.human_edited_text.as_deref() else {
                continue;
            };
            if is_trivial_edit(&draft.generated_text, edited) {
                report.trivial_skipped += 1;
                continue;
            }

            report.drafts_analyzed += 1;
            match self.mine_draft(&draft, edited, now).await {
                Ok(learnings) => {
                    for learning in learnings {
                        match self.db.insert_learning(&learning).await {
                            Ok(()) => report.learnings_created += 1,
                            Err(e) => {
                                warn!(draft_id = %draft.id, error = %e, "Failed to store learning");
                                report.failures += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(draft_id = %draft.id, error = %e, "Failed to mine draft");
                    report.failures += 1;
                }
            }
        }

        info!(
            analyzed = report.drafts_analyzed,
            created = report.learnings_created,
            failures = report.failures,
            trivial = report.trivial_skipped,
            "Learning mining complete"
        );
        Ok(report)
    }

    async fn mine_draft(
        &self,
        draft: &Draft,
        edited: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Learning>, PipelineError> {
        let history = self
            .db
            .get_conversation(&draft.conversation_id)
            .await?
            .map(|c| c.history)
            .unwrap_or_default();
        let recent = &history[history.len().saturating_sub(CONTEXT_MESSAGES)..];

        let user = build_miner_prompt(draft, edited, recent);
        let (raw, _) = self
            .gateway
            .generate_structured::<RawLearnings>(MINER_SYSTEM_PROMPT, &user, MINER_PARAMS)
            .await?;

        let mut learnings = Vec::with_capacity(raw.learnings.len());
        for entry in raw.learnings {
            let learning_type: LearningType = match entry.learning_type.parse() {
                Ok(t) => t,
                Err(e) => {
                    warn!(draft_id = %draft.id, error = %e, "Skipping learning with unknown type");
                    continue;
                }
            };
            learnings.push(Learning {
                id: Uuid::new_v4(),
                draft_id: draft.id,
                conversation_id: draft.conversation_id.clone(),
                learning_type,
                original_snippet: entry
                    .original_snippet
                    .unwrap_or_else(|| prefix(&draft.generated_text)),
                corrected_snippet: entry.corrected_snippet.unwrap_or_else(|| prefix(edited)),
                explanation: entry.explanation.trim().to_string(),
                confidence: entry.confidence.clamp(0.0, 1.0),
                stage: draft.stage,
                created_at: now,
            });
        }
        Ok(learnings)
    }
}

fn prefix(text: &str) -> String {
    text.chars().take(SNIPPET_FALLBACK_CHARS).collect()
}

fn build_miner_prompt(
    draft: &Draft,
    edited: &str,
    recent: &[crate::pipeline::types::HistoryMessage],
) -> String {
    let mut parts = vec![format!("## Funnel Stage: {}", draft.stage)];
    if !recent.is_empty() {
        parts.push(format!("\n## Conversation Context\n{}", history_section(recent)));
    }
    parts.push(format!("\n## Original AI Draft\n{}", draft.generated_text));
    parts.push(format!("\n## Human-Edited Version\n{edited}"));
    parts.push("\nAnalyze what changed and why.".to_string());
    parts.join("\n")
}

const MINER_SYSTEM_PROMPT: &str = r#"You compare AI-generated LinkedIn reply drafts with the version a human actually approved.

Identify what changed and why the human changed it. Classify each change as one of:
- tone: the register changed (too formal to casual, too pushy to gentle)
- content: specific content was added or removed
- structure: the message was shortened, reordered, or had questions removed
- stop_signal: the lead should not have been contacted at all
- product_knowledge: the human added product or service details the AI lacked

Respond with only a JSON object:
{
  "learnings": [
    {
      "type": "<tone|content|structure|stop_signal|product_knowledge>",
      "original_snippet": "<relevant part of the AI draft>",
      "corrected_snippet": "<what the human changed it to>",
      "explanation": "<why, in 1-2 sentences>",
      "confidence": <0.0-1.0>
    }
  ]
}

If the edit is trivial (typo, minor punctuation), return {"learnings": []}."#;
