//! Example retriever: past approved exchanges at the same stage, used as
//! few-shot guidance for drafting.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::drafts::model::DraftStatus;
use crate::error::PipelineError;
use crate::pipeline::types::{FunnelStage, LeadContext};
use crate::store::Database;

/// Candidate pool is this many times the requested limit.
const OVER_FETCH_FACTOR: usize = 5;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "shall", "i",
    "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
    "his", "its", "our", "their", "this", "that", "these", "those", "and", "but", "or", "not",
    "no", "yes", "so", "if", "then", "than", "too", "very", "just", "also", "of", "in", "on",
    "at", "to", "for", "with", "from", "by", "as", "into", "about",
];

/// One past exchange shown to the drafter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedExample {
    pub lead_message: String,
    /// What we actually sent (or the AI text when nothing was recorded as sent).
    pub reply: String,
    pub is_first_reply: bool,
    pub was_edited: bool,
}

pub struct ExampleRetriever {
    db: Arc<dyn Database>,
}

impl ExampleRetriever {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Up to `limit` examples, most relevant *last*. An empty pool is not an error.
    pub async fn retrieve(
        &self,
        stage: FunnelStage,
        lead_context: &LeadContext,
        current_message: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedExample>, PipelineError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let drafts = self
            .db
            .list_example_candidates(
                stage,
                &[DraftStatus::Approved, DraftStatus::Sent],
                limit * OVER_FETCH_FACTOR,
            )
            .await?;

        if drafts.is_empty() {
            debug!(stage = %stage, "No approved examples for stage");
            return Ok(Vec::new());
        }

        let mut candidates = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let lead_message = if draft.lead_message.trim().is_empty() {
                self.db
                    .get_conversation(&draft.conversation_id)
                    .await?
                    .and_then(|c| c.last_lead_message().map(str::to_string))
            } else {
                Some(draft.lead_message.clone())
            };
            let Some(lead_message) = lead_message.filter(|m| !m.trim().is_empty()) else {
                continue;
            };

            let was_edited = draft
                .sent_text
                .as_deref()
                .is_some_and(|sent| sent != draft.generated_text);
            candidates.push(RetrievedExample {
                lead_message,
                reply: draft.sent_text.unwrap_or(draft.generated_text),
                is_first_reply: draft.is_first_reply,
                was_edited,
            });
        }

        let selected = rank_examples(candidates, lead_context.is_first_reply, current_message, limit);
        info!(stage = %stage, count = selected.len(), "Retrieved examples");
        Ok(selected)
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Relevance of one candidate to the current message.
pub fn relevance_score(
    example: &RetrievedExample,
    current_is_first: bool,
    current_len: usize,
    current_keywords: &HashSet<String>,
) -> f64 {
    let mut score = 0.0;
    if example.is_first_reply == current_is_first {
        score += 3.0;
    }

    let ex_len = example.lead_message.chars().count();
    let ratio = current_len.min(ex_len) as f64 / current_len.max(ex_len).max(1) as f64;
    score += ratio * 2.0;

    let shared = keywords(&example.lead_message)
        .intersection(current_keywords)
        .count();
    score += shared as f64 * 0.5;

    if !example.was_edited {
        score += 1.0;
    }
    score
}

/// Rank descending (stable), keep `limit`, then reverse so the best is last.
pub fn rank_examples(
    examples: Vec<RetrievedExample>,
    current_is_first: bool,
    current_message: &str,
    limit: usize,
) -> Vec<RetrievedExample> {
    let current_len = current_message.chars().count();
    let current_keywords = keywords(current_message);

    let mut scored: Vec<(f64, RetrievedExample)> = examples
        .into_iter()
        .map(|ex| {
            (
                relevance_score(&ex, current_is_first, current_len, &current_keywords),
                ex,
            )
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut selected: Vec<RetrievedExample> =
        scored.into_iter().take(limit).map(|(_, ex)| ex).collect();
    selected.reverse();
    selected
}

/// Render examples as a prompt section; empty string when there are none.
pub fn format_examples(examples: &[RetrievedExample]) -> String {
    if examples.is_empty() {
        return String::new();
    }

    let mut lines =
        vec!["## Similar Past Conversations (style reference only; adapt, don't copy)\n".to_string()];
    for (i, ex) in examples.iter().enumerate() {
        let label = if ex.is_first_reply {
            "first reply"
        } else {
            "continuing conversation"
        };
        lines.push(format!("Example {} ({label}):", i + 1));
        lines.push(format!("Lead: \"{}\"", ex.lead_message));
        for line in ex.reply.trim().lines().map(str::trim).filter(|l| !l.is_empty()) {
            lines.push(format!("You: \"{line}\""));
        }
        lines.push("[This was approved and sent]\n".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::model::fixtures;
    use crate::pipeline::types::{Conversation, HistoryMessage};
    use crate::store::LibSqlBackend;
    use chrono::Utc;

    fn ex(msg: &str, first: bool, edited: bool) -> RetrievedExample {
        RetrievedExample {
            lead_message: msg.to_string(),
            reply: format!("reply to {msg}"),
            is_first_reply: first,
            was_edited: edited,
        }
    }

    #[test]
    fn first_reply_match_dominates() {
        let examples = vec![
            ex("what do you do exactly", false, false),
            ex("what do you do exactly", true, false),
        ];
        let ranked = rank_examples(examples, true, "what do you do exactly", 2);
        // Best is last.
        assert!(ranked[1].is_first_reply);
        assert!(!ranked[0].is_first_reply);
    }

    #[test]
    fn stopwords_do_not_count_as_keywords() {
        let current = keywords("what is the price for this");
        assert!(current.contains("price"));
        assert!(!current.contains("the"));
        assert!(!current.contains("for"));
    }

    #[test]
    fn score_components() {
        let current_keywords = keywords("pricing for agencies");
        let e = ex("pricing for agencies", true, false);
        // 3 (first match) + 2 (same length) + 2 * 0.5 (pricing, agencies) + 1 (unedited)
        let score = relevance_score(&e, true, "pricing for agencies".len(), &current_keywords);
        assert!((score - 7.0).abs() < 1e-9);

        let edited = ex("pricing for agencies", true, true);
        let score = relevance_score(&edited, true, "pricing for agencies".len(), &current_keywords);
        assert!((score - 6.0).abs() < 1e-9);
    }

    #[test]
    fn rank_respects_limit_and_reverses() {
        let examples = vec![
            ex("a", false, true),
            ex("budget timeline team", true, false),
            ex("budget", true, false),
        ];
        let ranked = rank_examples(examples, true, "budget timeline team", 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[1].lead_message, "budget timeline team");
        assert_eq!(ranked[0].lead_message, "budget");
    }

    #[test]
    fn ties_keep_pool_order() {
        let examples = vec![ex("one", true, false), ex("two", true, false)];
        let ranked = rank_examples(examples, true, "xyz", 2);
        // Stable sort keeps "one" first; reversal puts it last.
        assert_eq!(ranked[1].lead_message, "one");
    }

    #[test]
    fn format_empty_is_empty() {
        assert_eq!(format_examples(&[]), "");
    }

    #[test]
    fn format_splits_reply_lines() {
        let e = RetrievedExample {
            lead_message: "sure".into(),
            reply: "nice\n\nwhat's your team size?".into(),
            is_first_reply: true,
            was_edited: false,
        };
        let out = format_examples(&[e]);
        assert!(out.contains("Example 1 (first reply):"));
        assert!(out.contains("You: \"nice\"\nYou: \"what's your team size?\""));
    }

    #[tokio::test]
    async fn retrieve_from_store() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        db.upsert_conversation(&Conversation {
            id: "c1".into(),
            lead_name: "Sam".into(),
            history: vec![HistoryMessage::lead("from history")],
            stage: Some(FunnelStage::PositiveReply),
            lead_context: LeadContext::default(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

        let mut approved = fixtures::draft("c1", "ai text");
        approved.status = DraftStatus::Sent;
        approved.sent_text = Some("edited and sent".into());
        db.upsert_draft(&approved).await.unwrap();

        let mut no_msg = fixtures::draft("c1", "other");
        no_msg.status = DraftStatus::Approved;
        no_msg.lead_message = String::new();
        db.upsert_draft(&no_msg).await.unwrap();

        let pending = fixtures::draft("c1", "still pending");
        db.upsert_draft(&pending).await.unwrap();

        let retriever = ExampleRetriever::new(db);
        let got = retriever
            .retrieve(FunnelStage::PositiveReply, &LeadContext::default(), "hi", 3)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        let sent = got.iter().find(|e| e.reply == "edited and sent").unwrap();
        assert!(sent.was_edited);
        let fallback = got.iter().find(|e| e.reply == "other").unwrap();
        assert_eq!(fallback.lead_message, "from history");
    }

    #[tokio::test]
    async fn empty_pool_is_empty_list() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let retriever = ExampleRetriever::new(db);
        let got = retriever
            .retrieve(FunnelStage::Booked, &LeadContext::default(), "hi", 3)
            .await
            .unwrap();
        assert!(got.is_empty());
    }
}
