//! Stage classifier: which funnel stage is this conversation in?

use serde::Deserialize;
use tracing::info;

use crate::error::PipelineError;
use crate::llm::{Gateway, GenerationParams};
use crate::pipeline::prompts::{history_section, lead_context_section};
use crate::pipeline::types::{FunnelStage, HistoryMessage, LeadContext};

/// Low temperature keeps the classification stable across calls.
const STAGE_PARAMS: GenerationParams = GenerationParams::new(0.3, 200);

/// Classifier output.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDecision {
    pub stage: FunnelStage,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    detected_stage: String,
    #[serde(default)]
    reasoning: String,
}

pub struct StageClassifier {
    gateway: Gateway,
}

impl StageClassifier {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Classify the conversation. No fallback stage: failure propagates.
    pub async fn classify(
        &self,
        lead_name: &str,
        latest_message: &str,
        history: &[HistoryMessage],
        lead_context: Option<&LeadContext>,
    ) -> Result<StageDecision, PipelineError> {
        let user = build_stage_user_prompt(lead_name, latest_message, history, lead_context);
        let (raw, _) = self
            .gateway
            .generate_structured::<RawStage>(STAGE_SYSTEM_PROMPT, &user, STAGE_PARAMS)
            .await?;

        let decision = StageDecision {
            stage: raw.detected_stage.parse()?,
            reasoning: raw.reasoning.trim().to_string(),
        };
        info!(stage = %decision.stage, "Stage classified");
        Ok(decision)
    }
}

fn build_stage_user_prompt(
    lead_name: &str,
    latest_message: &str,
    history: &[HistoryMessage],
    lead_context: Option<&LeadContext>,
) -> String {
    let mut out = format!("## Lead Information\n**Name:** {lead_name}\n");
    if let Some(ctx) = lead_context {
        let section = lead_context_section(ctx);
        if !section.is_empty() {
            out.push_str(&section);
            out.push('\n');
        }
    }
    out.push_str(&format!(
        "\n## Conversation History\n{}\n\n## Lead's Latest Message\n\"{latest_message}\"\n\n\
         Based on the history and the latest message, determine the current funnel stage. \
         Return your analysis as JSON.",
        history_section(history)
    ));
    out
}

const STAGE_SYSTEM_PROMPT: &str = r#"You analyze LinkedIn sales conversations and decide which funnel stage they are in.

## Funnel Stages

### initiated
We sent an opening message; the lead hasn't replied yet. Only our messages exist.

### positive_reply
The lead replied but we haven't proposed a call. Signals: "sounds interesting", "tell me more", "what do you do", questions about the service.

### pitched
We invited them to a call or meeting. Our earlier messages mention "hop on a call", "15 minutes", "quick chat", "set up a meeting".

### calendar_sent
They agreed to meet and we sent a booking link.

### booked
They confirmed or booked a time. Signals: "booked", "see you then", a specific confirmed time.

### regeneration
The conversation went cold (days or weeks of silence) and is being re-engaged.

## Output Format

Respond with a JSON object only:
{"detected_stage": "<stage_name>", "reasoning": "<1-2 sentences>"}

Use exactly one of: initiated, positive_reply, pitched, calendar_sent, booked, regeneration"#;
