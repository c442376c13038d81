//! Reply pipeline: turns one inbound trigger into a stored draft.
//!
//! **Core invariant: a draft QA blocked never reaches the review queue.**
//! Blocked drafts are stored as `rejected` for the learning loop and audit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::drafts::model::{Draft, DraftStatus};
use crate::drafts::queue::DraftQueue;
use crate::error::PipelineError;
use crate::llm::Gateway;
use crate::pipeline::generator::{DraftGenerator, DraftRequest};
use crate::pipeline::judge::Judge;
use crate::pipeline::qa::{QaGate, QaOutcome};
use crate::pipeline::retriever::ExampleRetriever;
use crate::pipeline::revision::{RevisionController, RevisionOutcome};
use crate::pipeline::stage::{StageClassifier, StageDecision};
use crate::pipeline::types::{Conversation, HistoryMessage, InboundTrigger};
use crate::store::Database;

/// Everything the pipeline decided for one trigger. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct DraftOutcome {
    pub draft_id: Uuid,
    pub trigger: InboundTrigger,
    pub stage: StageDecision,
    pub revision: RevisionOutcome,
    pub qa: QaOutcome,
}

impl DraftOutcome {
    /// Blocked drafts are rejected outright; everything else awaits review.
    pub fn status(&self) -> DraftStatus {
        if self.qa.is_blocked() {
            DraftStatus::Rejected
        } else {
            DraftStatus::Pending
        }
    }

    /// Very first AI text, when the final text replaced it.
    fn pre_revision_text(&self) -> Option<String> {
        let first = self
            .revision
            .pre_revision_text
            .as_deref()
            .unwrap_or(&self.revision.text);
        (first != self.qa.text).then(|| first.to_string())
    }

    pub fn into_draft(self, now: DateTime<Utc>) -> Draft {
        let status = self.status();
        let pre_revision_text = self.pre_revision_text();
        let judge = self.revision.judge;
        let qa = self.qa.result;

        Draft {
            id: self.draft_id,
            conversation_id: self.trigger.conversation_id,
            lead_name: self.trigger.lead_name,
            lead_message: self.trigger.latest_message,
            generated_text: self.qa.text,
            pre_revision_text,
            human_edited_text: None,
            sent_text: None,
            stage: self.stage.stage,
            stage_reasoning: self.stage.reasoning,
            judge_score: judge.as_ref().map(|j| j.weighted_score),
            judge_scores: judge.as_ref().map(|j| j.scores),
            judge_feedback: judge.map(|j| j.feedback),
            revision_count: self.revision.revision_count,
            qa_score: qa.as_ref().map(|r| r.score),
            qa_verdict: qa.as_ref().map(|r| r.verdict),
            qa_issues: qa.as_ref().map(|r| r.issues.clone()).unwrap_or_default(),
            qa_reasoning: qa.as_ref().map(|r| r.reasoning.clone()),
            qa_model: qa.as_ref().map(|r| r.model.clone()),
            qa_cost_usd: qa.as_ref().map_or(Decimal::ZERO, |r| r.cost_usd),
            must_not_reply: qa.as_ref().is_some_and(|r| r.must_not_reply),
            is_first_reply: self.trigger.lead_context.is_first_reply,
            status,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct ReplyPipeline {
    classifier: StageClassifier,
    retriever: ExampleRetriever,
    revision: RevisionController,
    qa: QaGate,
    db: Arc<dyn Database>,
    queue: Arc<DraftQueue>,
    example_limit: usize,
}

impl ReplyPipeline {
    /// `review` backs the classifier, judge, and QA gate; `draft` backs generation.
    pub fn new(
        review: Gateway,
        draft: Gateway,
        db: Arc<dyn Database>,
        queue: Arc<DraftQueue>,
        config: &PipelineConfig,
    ) -> Self {
        let generator = DraftGenerator::new(draft);
        Self {
            classifier: StageClassifier::new(review.clone()),
            retriever: ExampleRetriever::new(db.clone()),
            revision: RevisionController::new(generator.clone(), Judge::new(review.clone())),
            qa: QaGate::new(review, generator, db.clone()),
            db,
            queue,
            example_limit: config.example_limit,
        }
    }

    /// Run the full flow, store the draft under `draft_id`, and queue it
    /// unless QA blocked it. Re-running with the same id overwrites a draft
    /// that is still pending; any other stored draft is returned untouched.
    pub async fn process(
        &self,
        draft_id: Uuid,
        trigger: InboundTrigger,
    ) -> Result<Draft, PipelineError> {
        trigger.validate()?;
        if let Some(existing) = self.db.get_draft(draft_id).await? {
            if existing.status != DraftStatus::Pending {
                info!(
                    draft_id = %draft_id,
                    status = %existing.status,
                    "Draft already resolved, ignoring redelivered trigger"
                );
                return Ok(existing);
            }
        }
        info!(
            draft_id = %draft_id,
            conversation_id = %trigger.conversation_id,
            lead = %trigger.lead_name,
            "Processing inbound trigger"
        );

        self.store_conversation(&trigger).await?;

        let outcome = self.run(draft_id, trigger).await?;
        self.db
            .update_conversation_stage(&outcome.trigger.conversation_id, outcome.stage.stage)
            .await?;

        let draft = outcome.into_draft(Utc::now());
        self.db.upsert_draft(&draft).await?;

        if draft.status == DraftStatus::Rejected {
            warn!(
                draft_id = %draft.id,
                qa_score = ?draft.qa_score,
                must_not_reply = draft.must_not_reply,
                "Draft blocked by QA, not queued"
            );
        } else {
            self.queue.push(draft.clone()).await;
        }

        info!(
            draft_id = %draft.id,
            stage = %draft.stage,
            judge_score = ?draft.judge_score,
            qa_verdict = ?draft.qa_verdict,
            revisions = draft.revision_count,
            "Draft stored"
        );
        Ok(draft)
    }

    /// Classify, retrieve, draft, judge, and gate. Touches the store only
    /// to read examples and guidelines.
    pub async fn run(
        &self,
        draft_id: Uuid,
        trigger: InboundTrigger,
    ) -> Result<DraftOutcome, PipelineError> {
        let stage = self
            .classifier
            .classify(
                &trigger.lead_name,
                &trigger.latest_message,
                &trigger.history,
                Some(&trigger.lead_context),
            )
            .await?;

        let examples = match self
            .retriever
            .retrieve(
                stage.stage,
                &trigger.lead_context,
                &trigger.latest_message,
                self.example_limit,
            )
            .await
        {
            Ok(examples) => examples,
            Err(e) => {
                warn!(error = %e, "Example retrieval failed, drafting without examples");
                Vec::new()
            }
        };

        let request = DraftRequest {
            lead_name: &trigger.lead_name,
            latest_message: &trigger.latest_message,
            stage: stage.stage,
            history: &trigger.history,
            lead_context: &trigger.lead_context,
            examples: &examples,
            guidance: None,
        };

        let revision = self.revision.run(&request).await?;
        let qa = self
            .qa
            .check_with_regen(&request, &revision.text, &stage.reasoning)
            .await;

        Ok(DraftOutcome {
            draft_id,
            trigger,
            stage,
            revision,
            qa,
        })
    }

    /// Upsert the conversation with the latest message appended to its history.
    async fn store_conversation(&self, trigger: &InboundTrigger) -> Result<(), PipelineError> {
        let now = Utc::now();
        let existing = self.db.get_conversation(&trigger.conversation_id).await?;

        let mut history = trigger.history.clone();
        history.push(HistoryMessage::lead(trigger.latest_message.clone()));

        let conversation = Conversation {
            id: trigger.conversation_id.clone(),
            lead_name: trigger.lead_name.clone(),
            history,
            stage: existing.as_ref().and_then(|c| c.stage),
            lead_context: trigger.lead_context.clone(),
            created_at: existing.map_or(now, |c| c.created_at),
            updated_at: now,
        };
        self.db.upsert_conversation(&conversation).await?;
        Ok(())
    }
}
