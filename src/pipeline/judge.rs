//! Judge: scores a candidate reply on five weighted dimensions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::PipelineError;
use crate::llm::{Gateway, GenerationParams};
use crate::pipeline::prompts::{history_section, lead_context_section};
use crate::pipeline::types::{HistoryMessage, LeadContext};

/// Dimension weights. Must sum to 1.0.
pub const DIMENSION_WEIGHTS: [(&str, f64); 5] = [
    ("contextual_relevance", 0.30),
    ("personalization", 0.25),
    ("tone", 0.20),
    ("cta_quality", 0.15),
    ("authenticity", 0.10),
];

const JUDGE_PARAMS: GenerationParams = GenerationParams::new(0.2, 500);

/// Per-dimension scores, each in [1, 5].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub contextual_relevance: f64,
    pub personalization: f64,
    pub tone: f64,
    pub cta_quality: f64,
    pub authenticity: f64,
}

impl DimensionScores {
    fn get(&self, dimension: &str) -> f64 {
        match dimension {
            "contextual_relevance" => self.contextual_relevance,
            "personalization" => self.personalization,
            "tone" => self.tone,
            "cta_quality" => self.cta_quality,
            "authenticity" => self.authenticity,
            _ => 0.0,
        }
    }

    fn clamped(self) -> Self {
        let c = |v: f64| v.clamp(1.0, 5.0);
        Self {
            contextual_relevance: c(self.contextual_relevance),
            personalization: c(self.personalization),
            tone: c(self.tone),
            cta_quality: c(self.cta_quality),
            authenticity: c(self.authenticity),
        }
    }
}

/// Judge verdict on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeResult {
    pub scores: DimensionScores,
    /// Σ score × weight, rounded to 2 decimals.
    pub weighted_score: f64,
    pub feedback: String,
}

/// Weighted sum of clamped scores, rounded to 2 decimals.
pub fn compute_weighted_score(scores: &DimensionScores) -> f64 {
    let clamped = scores.clamped();
    let total: f64 = DIMENSION_WEIGHTS
        .iter()
        .map(|(dim, weight)| clamped.get(dim) * weight)
        .sum();
    (total * 100.0).round() / 100.0
}

/// Inputs to a judge call.
pub struct JudgeInput<'a> {
    pub lead_name: &'a str,
    pub latest_message: &'a str,
    pub draft: &'a str,
    pub history: &'a [HistoryMessage],
    pub lead_context: &'a LeadContext,
}

pub struct Judge {
    gateway: Gateway,
}

impl Judge {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub async fn score(&self, input: &JudgeInput<'_>) -> Result<JudgeResult, PipelineError> {
        let user = build_judge_prompt(input);
        let (raw, _) = self
            .gateway
            .generate_structured::<Value>(JUDGE_SYSTEM_PROMPT, &user, JUDGE_PARAMS)
            .await?;
        let result = parse_judge_response(&raw)?;
        info!(
            weighted_score = result.weighted_score,
            "Draft judged"
        );
        Ok(result)
    }
}

/// Validate the decoded judge payload. Every dimension must be present.
fn parse_judge_response(raw: &Value) -> Result<JudgeResult, PipelineError> {
    let scores_obj = raw
        .get("scores")
        .and_then(Value::as_object)
        .ok_or_else(|| PipelineError::Validation("judge response missing 'scores'".to_string()))?;

    let mut values = [0.0f64; 5];
    for (i, (dim, _)) in DIMENSION_WEIGHTS.iter().enumerate() {
        values[i] = scores_obj
            .get(*dim)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                PipelineError::Validation(format!("judge response missing dimension '{dim}'"))
            })?;
    }

    let scores = DimensionScores {
        contextual_relevance: values[0],
        personalization: values[1],
        tone: values[2],
        cta_quality: values[3],
        authenticity: values[4],
    }
    .clamped();

    let feedback = raw
        .get("feedback")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(JudgeResult {
        weighted_score: compute_weighted_score(&scores),
        scores,
        feedback,
    })
}

fn build_judge_prompt(input: &JudgeInput<'_>) -> String {
    let mut parts = vec![format!("## Lead: {}", input.lead_name)];

    let ctx = lead_context_section(input.lead_context);
    if !ctx.is_empty() {
        parts.push(format!("\n## Lead Context\n{ctx}"));
    }
    parts.push(format!(
        "\n## Conversation History\n{}",
        history_section(input.history)
    ));
    parts.push(format!(
        "\n## Lead's Latest Message\n\"{}\"",
        input.latest_message
    ));
    parts.push(format!("\n## Draft Reply to Evaluate\n\"{}\"", input.draft));
    parts.push("\nScore this draft on all 5 dimensions and give actionable feedback.".to_string());
    parts.join("\n")
}

const JUDGE_SYSTEM_PROMPT: &str = r#"You are a strict quality judge for LinkedIn reply drafts in a B2B sales context.

The drafts are written on behalf of someone who helps business owners grow through LinkedIn. Catch generic, repetitive, or tone-deaf replies before a human sees them.

Score each dimension from 1 to 5.

### contextual_relevance (weight 0.30)
Does the draft answer what the lead actually said?
1 = ignores their message; 3 = vaguely related; 5 = addresses every point.

### personalization (weight 0.25)
Does it use specifics from the conversation (company, role, something they said)?
1 = could be sent to anyone; 3 = name only; 5 = details only this lead would recognize.

### tone (weight 0.20)
Does it sound like a real person on LinkedIn, matching the lead's energy?
1 = marketing email or chatbot; 3 = slightly stiff; 5 = natural.

### cta_quality (weight 0.15)
Is there one clear, low-friction next step that fits the stage?
1 = none, or a hard sell; 3 = generic; 5 = natural next step.

### authenticity (weight 0.10)
Does it avoid AI-sounding phrases ("I'd love to...", "That's fantastic!", "I appreciate you sharing...")?
1 = obviously AI; 3 = one or two slips; 5 = indistinguishable from a skilled human.

## Output Format

Return only JSON:
{
  "scores": {
    "contextual_relevance": <1-5>,
    "personalization": <1-5>,
    "tone": <1-5>,
    "cta_quality": <1-5>,
    "authenticity": <1-5>
  },
  "feedback": "<2-3 specific, actionable sentences for the writer>"
}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::llm::testing::ScriptedLlm;

    fn scores(v: [f64; 5]) -> DimensionScores {
        DimensionScores {
            contextual_relevance: v[0],
            personalization: v[1],
            tone: v[2],
            cta_quality: v[3],
            authenticity: v[4],
        }
    }

    #[test]
    fn weights_sum_to_one() {
        let total: f64 = DIMENSION_WEIGHTS.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_score_all_fives() {
        assert_eq!(compute_weighted_score(&scores([5.0; 5])), 5.0);
    }

    #[test]
    fn weighted_score_all_ones() {
        assert_eq!(compute_weighted_score(&scores([1.0; 5])), 1.0);
    }

    #[test]
    fn weighted_score_descending() {
        // 1.5 + 1.0 + 0.6 + 0.3 + 0.1
        assert_eq!(
            compute_weighted_score(&scores([5.0, 4.0, 3.0, 2.0, 1.0])),
            3.5
        );
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        assert_eq!(compute_weighted_score(&scores([9.0; 5])), 5.0);
        assert_eq!(compute_weighted_score(&scores([0.0; 5])), 1.0);
    }

    #[test]
    fn parse_full_response() {
        let raw = serde_json::json!({
            "scores": {
                "contextual_relevance": 4, "personalization": 4, "tone": 4,
                "cta_quality": 4, "authenticity": 4
            },
            "feedback": "  Mention their hiring post.  "
        });
        let result = parse_judge_response(&raw).unwrap();
        assert_eq!(result.weighted_score, 4.0);
        assert_eq!(result.feedback, "Mention their hiring post.");
    }

    #[test]
    fn missing_dimension_is_validation_error() {
        let raw = serde_json::json!({
            "scores": {
                "contextual_relevance": 4, "personalization": 4, "tone": 4,
                "cta_quality": 4
            },
            "feedback": "x"
        });
        let err = parse_judge_response(&raw).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(m) if m.contains("authenticity")));
    }

    #[test]
    fn missing_scores_object_is_validation_error() {
        let raw = serde_json::json!({"feedback": "x"});
        assert!(matches!(
            parse_judge_response(&raw),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn prompt_contains_sections() {
        let ctx = LeadContext {
            title: Some("Founder".into()),
            ..Default::default()
        };
        let prompt = build_judge_prompt(&JudgeInput {
            lead_name: "Sam",
            latest_message: "what do you do?",
            draft: "we help founders",
            history: &[],
            lead_context: &ctx,
        });
        assert!(prompt.starts_with("## Lead: Sam"));
        assert!(prompt.contains("## Lead Context\n**Title:** Founder"));
        assert!(prompt.contains("## Draft Reply to Evaluate\n\"we help founders\""));
    }

    #[tokio::test]
    async fn score_via_gateway() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"```json
{"scores": {"contextual_relevance": 5, "personalization": 4, "tone": 3, "cta_quality": 2, "authenticity": 1}, "feedback": "ok"}
```"#
            .to_string())]));
        let judge = Judge::new(Gateway::new(llm));
        let ctx = LeadContext::default();
        let result = judge
            .score(&JudgeInput {
                lead_name: "Sam",
                latest_message: "hi",
                draft: "hello",
                history: &[],
                lead_context: &ctx,
            })
            .await
            .unwrap();
        assert_eq!(result.weighted_score, 3.5);
    }
}
