//! End-to-end runs of the reply pipeline and the learning loop against a
//! real libsql database, with scripted model providers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use reply_qc::config::{LearningConfig, PipelineConfig};
use reply_qc::drafts::{DraftQueue, DraftStatus};
use reply_qc::error::LlmError;
use reply_qc::learning::{GuidelineConsolidator, GuidelineScope, LearningMiner};
use reply_qc::llm::{
    CompletionRequest, CompletionResponse, FinishReason, Gateway, LlmProvider, Role,
};
use reply_qc::pipeline::{FunnelStage, InboundTrigger, LeadContext, ReplyPipeline};
use reply_qc::store::{Database, LibSqlBackend};

// ── Scripted provider ───────────────────────────────────────────────

struct Script {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl Script {
    fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for Script {
    fn model_name(&self) -> &str {
        "script"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);

        let content = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::RequestFailed {
                provider: "script".to_string(),
                reason: "script exhausted".to_string(),
            })?;
        Ok(CompletionResponse {
            content,
            input_tokens: 10,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

const STAGE_REPLY: &str = r#"{"detected_stage": "positive_reply", "reasoning": "lead wants details"}"#;
const QA_PASS: &str =
    r#"{"score": 4.5, "issues": [], "should_not_reply": false, "reasoning": "on point"}"#;

fn judge_reply(score: u8) -> String {
    serde_json::json!({
        "scores": {
            "contextual_relevance": score, "personalization": score, "tone": score,
            "cta_quality": score, "authenticity": score
        },
        "feedback": "fine"
    })
    .to_string()
}

/// Classifier, judge, and QA replies for one passing draft.
fn passing_review() -> Vec<String> {
    vec![STAGE_REPLY.to_string(), judge_reply(5), QA_PASS.to_string()]
}

fn trigger(conversation_id: &str, lead_name: &str, message: &str) -> InboundTrigger {
    InboundTrigger {
        conversation_id: conversation_id.to_string(),
        lead_name: lead_name.to_string(),
        latest_message: message.to_string(),
        history: vec![],
        lead_context: LeadContext {
            company: Some("Acme".to_string()),
            ..LeadContext::default()
        },
    }
}

fn pipeline(
    review: Arc<Script>,
    draft: Arc<Script>,
    db: Arc<dyn Database>,
    queue: Arc<DraftQueue>,
) -> ReplyPipeline {
    ReplyPipeline::new(
        Gateway::new(review),
        Gateway::new(draft),
        db,
        queue,
        &PipelineConfig::default(),
    )
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn human_edits_become_guidelines_that_reach_the_qa_gate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reply-qc.db");
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let queue = DraftQueue::new(db.clone());

    // Three conversations drafted, edited by a human, and sent.
    let leads = [("conv_a", "Ana"), ("conv_b", "Ben"), ("conv_c", "Cat")];
    let review = Script::new(leads.iter().flat_map(|_| passing_review()));
    let draft = Script::new(leads.iter().map(|(_, name)| {
        format!("Hi {name}! I would absolutely love to jump on a call this week to walk you through everything!")
    }));
    let pipe = pipeline(review.clone(), draft.clone(), db.clone(), queue.clone());

    for (conv, name) in leads {
        let stored = pipe
            .process(uuid::Uuid::new_v4(), trigger(conv, name, "tell me more about pricing"))
            .await
            .unwrap();
        assert_eq!(stored.status, DraftStatus::Pending);
        assert_eq!(stored.stage, FunnelStage::PositiveReply);

        let edited = format!("Hey {name}, happy to share pricing. Free for a quick call Thursday?");
        queue.edit(stored.id, &edited).await.unwrap().unwrap();
        let sent = queue.mark_sent(stored.id, None).await.unwrap().unwrap();
        assert_eq!(sent.status, DraftStatus::Sent);
        assert_eq!(sent.sent_text.as_deref(), Some(edited.as_str()));
    }
    assert!(queue.pending().await.is_empty());
    assert_eq!(review.remaining(), 0);

    // Mine each edit.
    let learning = serde_json::json!({
        "learnings": [{
            "type": "tone",
            "original_snippet": "I would absolutely love to",
            "corrected_snippet": "happy to share",
            "explanation": "Over-eager opener; the human prefers a relaxed register.",
            "confidence": 0.9
        }]
    })
    .to_string();
    let config = LearningConfig::default();
    let miner = LearningMiner::new(
        Gateway::new(Script::new(vec![learning; 3])),
        db.clone(),
        config.lookback,
    );
    let mined = miner.run(Utc::now()).await.unwrap();
    assert_eq!(mined.drafts_analyzed, 3);
    assert_eq!(mined.learnings_created, 3);

    // Consolidate the three learnings into one stage guideline.
    let rule = "Open with a relaxed acknowledgement instead of enthusiastic filler";
    let proposal = serde_json::json!({
        "guidelines": [{
            "stage": "positive_reply",
            "guideline_type": "tone_rule",
            "content": rule,
            "source_count": 3
        }]
    })
    .to_string();
    let consolidator = GuidelineConsolidator::new(
        Gateway::new(Script::new([proposal])),
        db.clone(),
        config.window,
        config.prune_after,
        config.min_support,
    );
    let report = consolidator.run(Utc::now()).await.unwrap();
    assert_eq!(report.learnings_considered, 3);
    assert_eq!(report.created, 1);
    assert!(report.error.is_none());

    let guidelines = db.list_guidelines().await.unwrap();
    let created = guidelines.iter().find(|g| g.content == rule).unwrap();
    assert_eq!(created.scope, GuidelineScope::Stage(FunnelStage::PositiveReply));
    assert!(created.is_active);

    // The next draft at that stage sees the past replies and the new rule.
    let review = Script::new(passing_review());
    let draft = Script::new(["Hey Dan, happy to share pricing. Does Friday work?"]);
    let pipe = pipeline(review.clone(), draft.clone(), db.clone(), queue.clone());
    let stored = pipe
        .process(uuid::Uuid::new_v4(), trigger("conv_d", "Dan", "what does it cost?"))
        .await
        .unwrap();
    assert_eq!(stored.status, DraftStatus::Pending);

    let draft_prompt = draft.last_prompt();
    assert!(draft_prompt.contains("Similar Past Conversations"));
    assert!(draft_prompt.contains("happy to share pricing"));
    assert!(review.last_prompt().contains(rule));

    // A fresh process on the same file restores the pending draft.
    drop(pipe);
    drop(queue);
    drop(db);
    let reopened: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let restored = DraftQueue::new(reopened);
    assert_eq!(restored.load_pending().await.unwrap(), 1);
    assert_eq!(restored.pending().await[0].id, stored.id);
}

#[tokio::test]
async fn lead_asking_not_to_be_contacted_is_rejected_and_never_queued() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let queue = DraftQueue::new(db.clone());
    let mut events = queue.subscribe();

    let qa_block = serde_json::json!({
        "score": 4.8,
        "issues": [{"type": "tone", "severity": "high", "detail": "lead opted out"}],
        "should_not_reply": true,
        "reasoning": "The lead asked us to stop messaging."
    })
    .to_string();
    let review = Script::new([STAGE_REPLY.to_string(), judge_reply(5), qa_block]);
    let draft = Script::new(["Totally understand, Eve! Quick question before you go..."]);
    let pipe = pipeline(review.clone(), draft.clone(), db.clone(), queue.clone());

    let stored = pipe
        .process(
            uuid::Uuid::new_v4(),
            trigger("conv_e", "Eve", "please stop messaging me"),
        )
        .await
        .unwrap();

    assert_eq!(stored.status, DraftStatus::Rejected);
    assert!(stored.must_not_reply);
    assert_eq!(stored.qa_score, Some(1.0));
    assert!(!stored.can_auto_send());

    // No regeneration was attempted.
    assert_eq!(review.remaining(), 0);
    assert_eq!(draft.remaining(), 0);

    assert!(queue.is_empty().await);
    assert!(events.try_recv().is_err());
    let persisted = db.get_draft(stored.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, DraftStatus::Rejected);
}
