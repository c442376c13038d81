//! Guideline consolidator: turns a week of learnings into QA guidelines.
//!
//! Candidates need enough support from distinct conversations; near
//! duplicates of an active guideline reinforce it instead of adding a new
//! one. Guidelines nobody reinforces for long enough are deactivated.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, PipelineError};
use crate::learning::model::{Guideline, GuidelineKind, GuidelineScope, Learning};
use crate::llm::{Gateway, GenerationParams};
use crate::pipeline::types::FunnelStage;
use crate::store::Database;

const CONSOLIDATION_PARAMS: GenerationParams = GenerationParams::new(0.3, 1000);

/// Learnings shown per (stage, type) group.
const MAX_PER_GROUP: usize = 5;
const SNIPPET_CHARS: usize = 100;

/// Overlap above which a candidate reinforces an existing guideline.
const DUPLICATE_OVERLAP: f64 = 0.5;

const SEED_OCCURRENCES: u32 = 10;

const SEED_GUIDELINES: [(GuidelineScope, GuidelineKind, &str); 3] = [
    (
        GuidelineScope::All,
        GuidelineKind::Do,
        "If the lead asks 'what do you do?' or similar, the reply MUST explain the LinkedIn client acquisition service. Never deflect.",
    ),
    (
        GuidelineScope::Stage(FunnelStage::PositiveReply),
        GuidelineKind::ToneRule,
        "positive_reply drafts must read like a casual text message, not a professional assistant. Short sentences, like texting a friend.",
    ),
    (
        GuidelineScope::All,
        GuidelineKind::Dont,
        "If the lead says 'not interested', 'stop messaging', 'unsubscribe', or similar, flag should_not_reply. Do NOT write a persuasive reply.",
    ),
];

/// Counts from one consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub learnings_considered: usize,
    pub created: usize,
    pub reinforced: usize,
    pub discarded: usize,
    pub pruned: usize,
    /// Candidates the store failed to write.
    pub failures: usize,
    /// Set when the consolidation call failed; pruning still ran.
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCandidates {
    #[serde(default)]
    guidelines: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default = "default_stage")]
    stage: String,
    #[serde(default = "default_kind")]
    guideline_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    source_count: u32,
}

fn default_stage() -> String {
    "all".to_string()
}

fn default_kind() -> String {
    "do".to_string()
}

/// `|A ∩ B| / max(|A|, |B|)` over lowercased whitespace tokens.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.split_whitespace().map(str::to_lowercase).collect()
    };
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / a.len().max(b.len()) as f64
}

pub struct GuidelineConsolidator {
    gateway: Gateway,
    db: Arc<dyn Database>,
    window: chrono::Duration,
    prune_after: chrono::Duration,
    min_support: u32,
}

impl GuidelineConsolidator {
    pub fn new(
        gateway: Gateway,
        db: Arc<dyn Database>,
        window: chrono::Duration,
        prune_after: chrono::Duration,
        min_support: u32,
    ) -> Self {
        Self {
            gateway,
            db,
            window,
            prune_after,
            min_support,
        }
    }

    /// Insert the bootstrap guidelines that don't exist yet (by scope and
    /// content, active or not). Returns how many were inserted.
    pub async fn seed_guidelines(&self) -> Result<usize, DatabaseError> {
        let mut seeded = 0;
        for (scope, kind, content) in SEED_GUIDELINES {
            if self.db.guideline_exists(scope, content).await? {
                continue;
            }
            self.db
                .insert_guideline(&Guideline::new(scope, kind, content, SEED_OCCURRENCES))
                .await?;
            seeded += 1;
        }
        info!(seeded, "Seeded QA guidelines");
        Ok(seeded)
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<ConsolidationReport, DatabaseError> {
        let mut report = ConsolidationReport::default();
        let learnings = match self.db.list_learnings_since(now - self.window).await {
            Ok(learnings) => learnings,
            Err(e) => {
                warn!(error = %e, "Failed to load recent learnings");
                report.error = Some(e.to_string());
                Vec::new()
            }
        };
        report.learnings_considered = learnings.len();

        if learnings.is_empty() {
            if report.error.is_none() {
                info!("No recent learnings to consolidate");
            }
        } else {
            match self.propose(&learnings).await {
                Ok(candidates) => self.apply(candidates, &learnings, now, &mut report).await,
                Err(e) => {
                    warn!(error = %e, "Guideline consolidation call failed");
                    report.error = Some(e.to_string());
                }
            }
        }

        report.pruned = self
            .db
            .deactivate_stale_guidelines(now - self.prune_after)
            .await?;

        info!(
            considered = report.learnings_considered,
            created = report.created,
            reinforced = report.reinforced,
            discarded = report.discarded,
            pruned = report.pruned,
            failures = report.failures,
            "Guideline consolidation complete"
        );
        Ok(report)
    }

    async fn propose(&self, learnings: &[Learning]) -> Result<Vec<RawCandidate>, PipelineError> {
        let user = build_consolidation_prompt(learnings);
        let (raw, _) = self
            .gateway
            .generate_structured::<RawCandidates>(
                CONSOLIDATION_SYSTEM_PROMPT,
                &user,
                CONSOLIDATION_PARAMS,
            )
            .await?;
        Ok(raw.guidelines)
    }

    async fn apply(
        &self,
        candidates: Vec<RawCandidate>,
        learnings: &[Learning],
        now: DateTime<Utc>,
        report: &mut ConsolidationReport,
    ) {
        for candidate in candidates {
            let content = candidate.content.trim();
            let scope = match candidate.stage.parse::<GuidelineScope>() {
                Ok(scope) if !content.is_empty() => scope,
                Ok(_) => {
                    report.discarded += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Discarding guideline with unknown stage");
                    report.discarded += 1;
                    continue;
                }
            };
            let kind = candidate
                .guideline_type
                .parse::<GuidelineKind>()
                .unwrap_or(GuidelineKind::Do);

            let conversations = distinct_conversations(learnings, scope);
            if candidate.source_count < self.min_support
                || conversations < self.min_support as usize
            {
                debug!(
                    scope = %scope,
                    source_count = candidate.source_count,
                    conversations,
                    "Discarding under-supported guideline"
                );
                report.discarded += 1;
                continue;
            }

            match self
                .store_candidate(scope, kind, content, candidate.source_count, now)
                .await
            {
                Ok(Stored::Reinforced) => report.reinforced += 1,
                Ok(Stored::Created) => report.created += 1,
                Err(e) => {
                    warn!(scope = %scope, kind = %kind, error = %e, "Failed to store guideline");
                    report.failures += 1;
                }
            }
        }
    }

    /// Reinforce the first active near duplicate, or insert a new guideline.
    async fn store_candidate(
        &self,
        scope: GuidelineScope,
        kind: GuidelineKind,
        content: &str,
        source_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Stored, DatabaseError> {
        let existing = self.db.list_active_guidelines(scope, kind).await?;
        if let Some(matched) = existing
            .iter()
            .find(|g| token_overlap(&g.content, content) > DUPLICATE_OVERLAP)
        {
            self.db.reinforce_guideline(matched.id, now).await?;
            debug!(guideline_id = %matched.id, "Guideline reinforced");
            return Ok(Stored::Reinforced);
        }

        let mut guideline = Guideline::new(scope, kind, content, source_count);
        guideline.created_at = now;
        guideline.last_reinforced_at = now;
        self.db.insert_guideline(&guideline).await?;
        info!(guideline_id = %guideline.id, scope = %scope, kind = %kind, "Guideline created");
        Ok(Stored::Created)
    }
}

enum Stored {
    Created,
    Reinforced,
}

/// Distinct source conversations among learnings the scope covers.
fn distinct_conversations(learnings: &[Learning], scope: GuidelineScope) -> usize {
    learnings
        .iter()
        .filter(|l| scope.covers(l.stage))
        .map(|l| l.conversation_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

fn truncate(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

fn build_consolidation_prompt(learnings: &[Learning]) -> String {
    let mut groups: BTreeMap<(&str, &str), Vec<&Learning>> = BTreeMap::new();
    for learning in learnings {
        groups
            .entry((learning.stage.as_str(), learning.learning_type.as_str()))
            .or_default()
            .push(learning);
    }

    let mut parts = vec!["## Recent Learnings from Human Edits\n".to_string()];
    for ((stage, kind), group) in &groups {
        parts.push(format!(
            "### Stage: {stage}, Type: {kind} ({} learnings)",
            group.len()
        ));
        for l in group.iter().take(MAX_PER_GROUP) {
            parts.push(format!("- Original: {}", truncate(&l.original_snippet)));
            parts.push(format!("  Corrected: {}", truncate(&l.corrected_snippet)));
            parts.push(format!("  Why: {}", l.explanation));
        }
        parts.push(String::new());
    }
    parts.join("\n")
}

const CONSOLIDATION_SYSTEM_PROMPT: &str = r#"You turn individual learnings from human edits into QA guidelines.

The learnings are grouped by funnel stage and type. Find patterns that recur across several conversations and write one guideline per pattern that a QA reviewer can apply to future drafts.

Respond with only a JSON object:
{
  "guidelines": [
    {
      "stage": "<funnel stage or 'all'>",
      "guideline_type": "<do|dont|example|tone_rule>",
      "content": "<clear, actionable guideline>",
      "source_count": <number of learnings it is based on>
    }
  ]
}

Only include patterns seen in 3 or more different conversations. Keep guidelines short and specific."#;
