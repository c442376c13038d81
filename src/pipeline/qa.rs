//! QA gate: last check before a draft reaches a human.
//!
//! Scores the chosen draft against stage tone rules and the mined
//! guidelines, decides pass / flag / block, and on a block regenerates
//! exactly once with the QA issues as guidance.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{info, warn};

use crate::drafts::model::{QaIssue, QaVerdict};
use crate::error::PipelineError;
use crate::learning::model::Guideline;
use crate::llm::{Gateway, GenerationParams};
use crate::pipeline::generator::{DraftGenerator, DraftRequest};
use crate::pipeline::prompts::history_section;
use crate::pipeline::types::FunnelStage;
use crate::store::Database;

pub const PASS_THRESHOLD: f64 = 4.0;
pub const FLAG_THRESHOLD: f64 = 3.0;
pub const MAX_GUIDELINES: usize = 15;

const QA_PARAMS: GenerationParams = GenerationParams::new(0.2, 600);

/// One QA evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct QaResult {
    pub score: f64,
    pub verdict: QaVerdict,
    pub issues: Vec<QaIssue>,
    pub must_not_reply: bool,
    pub reasoning: String,
    pub model: String,
    pub cost_usd: Decimal,
}

/// Final text after the gate plus the result that describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct QaOutcome {
    pub text: String,
    /// `None` when the initial QA call failed.
    pub result: Option<QaResult>,
    pub regenerated: bool,
}

impl QaOutcome {
    pub fn is_blocked(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.verdict == QaVerdict::Block)
    }

    pub fn must_not_reply(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.must_not_reply)
    }
}

/// Verdict for a (clamped) score.
pub fn verdict_for_score(score: f64) -> QaVerdict {
    if score >= PASS_THRESHOLD {
        QaVerdict::Pass
    } else if score >= FLAG_THRESHOLD {
        QaVerdict::Flag
    } else {
        QaVerdict::Block
    }
}

/// Feedback block handed to the drafter when QA blocks a draft.
pub fn regeneration_feedback(issues: &[QaIssue]) -> String {
    let mut lines = vec!["QA FEEDBACK - Fix these issues in your reply:".to_string()];
    for issue in issues {
        lines.push(format!(
            "- [{}] {}: {}",
            issue.severity.to_uppercase(),
            issue.issue_type,
            issue.detail
        ));
    }
    lines.join("\n")
}

pub struct QaGate {
    gateway: Gateway,
    generator: DraftGenerator,
    db: Arc<dyn Database>,
}

impl QaGate {
    pub fn new(gateway: Gateway, generator: DraftGenerator, db: Arc<dyn Database>) -> Self {
        Self {
            gateway,
            generator,
            db,
        }
    }

    /// Active guidelines for `stage` plus `all`, most reinforced first.
    /// A store failure yields an empty set.
    pub async fn load_guidelines(&self, stage: FunnelStage) -> Vec<Guideline> {
        match self.db.list_guidelines_for_stage(stage, MAX_GUIDELINES).await {
            Ok(guidelines) => guidelines,
            Err(e) => {
                warn!(stage = %stage, error = %e, "Failed to load QA guidelines");
                Vec::new()
            }
        }
    }

    /// Evaluate one draft.
    pub async fn check(
        &self,
        request: &DraftRequest<'_>,
        draft: &str,
        stage_reasoning: &str,
        guidelines: &[Guideline],
    ) -> Result<QaResult, PipelineError> {
        let user = build_qa_prompt(request, draft, stage_reasoning, guidelines);
        let (raw, generation) = self
            .gateway
            .generate_structured::<Value>(QA_SYSTEM_PROMPT, &user, QA_PARAMS)
            .await?;
        let mut result = parse_qa_response(&raw)?;
        result.model = self.gateway.model_name().to_string();
        result.cost_usd = generation.cost_usd;

        info!(
            lead = %request.lead_name,
            score = result.score,
            verdict = %result.verdict,
            issues = result.issues.len(),
            must_not_reply = result.must_not_reply,
            "QA check complete"
        );
        Ok(result)
    }

    /// Check, and on a block without must-not-reply regenerate once.
    pub async fn check_with_regen(
        &self,
        request: &DraftRequest<'_>,
        draft: &str,
        stage_reasoning: &str,
    ) -> QaOutcome {
        let guidelines = self.load_guidelines(request.stage).await;

        let first = match self.check(request, draft, stage_reasoning, &guidelines).await {
            Ok(result) => result,
            Err(e) => {
                warn!(lead = %request.lead_name, error = %e, "QA failed, passing draft through unscored");
                return QaOutcome {
                    text: draft.to_string(),
                    result: None,
                    regenerated: false,
                };
            }
        };

        if first.verdict != QaVerdict::Block || first.must_not_reply {
            if first.must_not_reply {
                info!(lead = %request.lead_name, "QA blocked draft: lead asked not to be contacted");
            }
            return QaOutcome {
                text: draft.to_string(),
                result: Some(first),
                regenerated: false,
            };
        }

        info!(
            lead = %request.lead_name,
            score = first.score,
            "QA blocked draft, regenerating with feedback"
        );

        let feedback = regeneration_feedback(&first.issues);
        let regen = match self
            .generator
            .generate(&request.with_guidance(&feedback))
            .await
        {
            Ok(generation) => generation.text,
            Err(e) => {
                warn!(lead = %request.lead_name, error = %e, "QA regeneration failed, keeping original");
                return QaOutcome {
                    text: draft.to_string(),
                    result: Some(first),
                    regenerated: false,
                };
            }
        };

        match self.check(request, &regen, stage_reasoning, &guidelines).await {
            Ok(mut second) => {
                second.cost_usd += first.cost_usd;
                if second.verdict == QaVerdict::Block {
                    info!(lead = %request.lead_name, score = second.score, "Regenerated draft also blocked");
                }
                QaOutcome {
                    text: regen,
                    result: Some(second),
                    regenerated: true,
                }
            }
            Err(e) => {
                warn!(lead = %request.lead_name, error = %e, "QA re-check failed, keeping original");
                QaOutcome {
                    text: draft.to_string(),
                    result: Some(first),
                    regenerated: false,
                }
            }
        }
    }
}

/// Validate the decoded QA payload and apply the verdict overrides.
fn parse_qa_response(raw: &Value) -> Result<QaResult, PipelineError> {
    let score = raw
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| PipelineError::Validation("QA response missing 'score'".to_string()))?;

    let must_not_reply = raw
        .get("should_not_reply")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let issues = raw
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse_issue).collect())
        .unwrap_or_default();

    let reasoning = raw
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let (score, verdict) = if must_not_reply {
        (1.0, QaVerdict::Block)
    } else {
        let clamped = score.clamp(1.0, 5.0);
        (clamped, verdict_for_score(clamped))
    };

    Ok(QaResult {
        score,
        verdict,
        issues,
        must_not_reply,
        reasoning,
        model: String::new(),
        cost_usd: Decimal::ZERO,
    })
}

fn parse_issue(item: &Value) -> QaIssue {
    let field = |key: &str, default: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(default)
            .to_string()
    };
    QaIssue {
        issue_type: field("type", "unknown"),
        detail: field("detail", ""),
        severity: field("severity", "medium"),
    }
}

fn build_qa_prompt(
    request: &DraftRequest<'_>,
    draft: &str,
    stage_reasoning: &str,
    guidelines: &[Guideline],
) -> String {
    let mut parts = vec![
        format!("## Lead: {}", request.lead_name),
        format!("## Detected Stage: {}", request.stage),
    ];
    if !stage_reasoning.trim().is_empty() {
        parts.push(format!("## Stage Reasoning: {}", stage_reasoning.trim()));
    }
    if !request.history.is_empty() {
        parts.push(format!(
            "\n## Conversation History\n{}",
            history_section(request.history)
        ));
    }
    parts.push(format!("\n## Lead's Latest Message\n{}", request.latest_message));
    parts.push(format!("\n## AI Draft Reply\n{draft}"));

    if !guidelines.is_empty() {
        parts.push("\n## Active QA Guidelines".to_string());
        for (i, g) in guidelines.iter().take(MAX_GUIDELINES).enumerate() {
            parts.push(format!(
                "{}. [{}] {}",
                i + 1,
                g.kind.as_str().to_uppercase(),
                g.content
            ));
        }
    }

    parts.push("\nEvaluate this draft and respond with the JSON object.".to_string());
    parts.join("\n")
}

const QA_SYSTEM_PROMPT: &str = r#"You are a QA reviewer for LinkedIn outreach reply drafts. Decide whether a draft is safe and effective to send to a prospect.

Evaluate:
1. Tone for the stage:
   - positive_reply: casual, like texting a friend. Short. No formal greetings.
   - pitched: professional but warm. Clear value.
   - calendar_sent: brief and encouraging. Remove friction.
   - booked: confirm and set expectations. No new asks.
   - regeneration: re-engage naturally. Not pushy.
   - initiated: the lead has not replied; any message must be a light nudge.
2. Product context: if the lead asks "what do you do?" or similar, the reply must actually explain the LinkedIn client acquisition service. Deflecting or staying vague is a failure.
3. Stop signals: if the lead wants no further contact ("not interested", "stop messaging", "unsubscribe", "please don't contact me", "no thanks"), set should_not_reply to true.
4. Repetition: does the draft repeat questions or points already covered in the history?
5. Stage accuracy: does the detected stage fit the conversation?
6. Guideline compliance: does the draft follow every active QA guideline listed?

Respond with only a JSON object:
{
  "score": <float 1.0-5.0>,
  "verdict": "<pass|flag|block>",
  "issues": [
    {"type": "<tone|product|stop_detection|repetition|stage_accuracy|guideline>", "detail": "<explanation>", "severity": "<low|medium|high>"}
  ],
  "should_not_reply": <true|false>,
  "reasoning": "<1-2 sentence summary>"
}

Scoring:
- 5.0: no issues.
- 4.0-4.9: minor issues that won't affect the conversation.
- 3.0-3.9: a human should review, but the draft is salvageable.
- 2.0-2.9: significant issues; regenerate.
- 1.0-1.9: must not be sent.

If should_not_reply is true the score must be 1.0."#;
