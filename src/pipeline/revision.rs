//! Generate, judge, and revise at most once.

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::generator::{DraftGenerator, DraftRequest};
use crate::pipeline::judge::{Judge, JudgeInput, JudgeResult};

/// Drafts at or above this weighted score are not revised.
pub const SCORE_THRESHOLD: f64 = 4.0;

/// Result of the generate/judge/revise loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionOutcome {
    pub text: String,
    /// First-attempt text, when the final text differs from it.
    pub pre_revision_text: Option<String>,
    /// `None` when the initial judge call failed.
    pub judge: Option<JudgeResult>,
    /// 1 when a regeneration was produced, whether or not it was kept.
    pub revision_count: u32,
}

impl RevisionOutcome {
    pub fn judge_score(&self) -> Option<f64> {
        self.judge.as_ref().map(|j| j.weighted_score)
    }
}

pub struct RevisionController {
    generator: DraftGenerator,
    judge: Judge,
}

impl RevisionController {
    pub fn new(generator: DraftGenerator, judge: Judge) -> Self {
        Self { generator, judge }
    }

    /// Only the first generation can fail the whole run. Every later step
    /// degrades to the best result obtained so far.
    pub async fn run(&self, request: &DraftRequest<'_>) -> Result<RevisionOutcome, PipelineError> {
        let original = self.generator.generate(request).await?.text;

        let initial = match self.judge.score(&judge_input(request, &original)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(lead = %request.lead_name, error = %e, "Judge failed, passing draft through unscored");
                return Ok(RevisionOutcome {
                    text: original,
                    pre_revision_text: None,
                    judge: None,
                    revision_count: 0,
                });
            }
        };

        if initial.weighted_score >= SCORE_THRESHOLD {
            return Ok(RevisionOutcome {
                text: original,
                pre_revision_text: None,
                judge: Some(initial),
                revision_count: 0,
            });
        }

        info!(
            lead = %request.lead_name,
            score = initial.weighted_score,
            "Draft below threshold, revising once"
        );

        let revised = match self
            .generator
            .generate(&request.with_guidance(&initial.feedback))
            .await
        {
            Ok(generation) => generation.text,
            Err(e) => {
                warn!(lead = %request.lead_name, error = %e, "Revision failed, keeping original");
                return Ok(RevisionOutcome {
                    text: original,
                    pre_revision_text: None,
                    judge: Some(initial),
                    revision_count: 0,
                });
            }
        };

        match self.judge.score(&judge_input(request, &revised)).await {
            Ok(rescored) if rescored.weighted_score > initial.weighted_score => {
                info!(
                    lead = %request.lead_name,
                    before = initial.weighted_score,
                    after = rescored.weighted_score,
                    "Revision kept"
                );
                Ok(RevisionOutcome {
                    text: revised,
                    pre_revision_text: Some(original),
                    judge: Some(rescored),
                    revision_count: 1,
                })
            }
            Ok(rescored) => {
                info!(
                    lead = %request.lead_name,
                    before = initial.weighted_score,
                    after = rescored.weighted_score,
                    "Revision not better, keeping original"
                );
                Ok(RevisionOutcome {
                    text: original,
                    pre_revision_text: None,
                    judge: Some(initial),
                    revision_count: 1,
                })
            }
            Err(e) => {
                warn!(lead = %request.lead_name, error = %e, "Re-judge failed, keeping revision with original score");
                Ok(RevisionOutcome {
                    text: revised,
                    pre_revision_text: Some(original),
                    judge: Some(initial),
                    revision_count: 1,
                })
            }
        }
    }
}

fn judge_input<'a>(request: &DraftRequest<'a>, draft: &'a str) -> JudgeInput<'a> {
    JudgeInput {
        lead_name: request.lead_name,
        latest_message: request.latest_message,
        draft,
        history: request.history,
        lead_context: request.lead_context,
    }
}
