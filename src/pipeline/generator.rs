//! Draft generator: one text call with the stage's instruction set.

use tracing::info;

use crate::error::PipelineError;
use crate::llm::{Gateway, Generation, GenerationParams};
use crate::pipeline::prompts::{DraftPromptInput, StagePrompt, build_draft_prompt};
use crate::pipeline::retriever::{RetrievedExample, format_examples};
use crate::pipeline::types::{FunnelStage, HistoryMessage, LeadContext};

const DRAFT_PARAMS: GenerationParams = GenerationParams::new(0.7, 500);

/// Everything the drafter sees for one attempt.
#[derive(Clone, Copy)]
pub struct DraftRequest<'a> {
    pub lead_name: &'a str,
    pub latest_message: &'a str,
    pub stage: FunnelStage,
    pub history: &'a [HistoryMessage],
    pub lead_context: &'a LeadContext,
    pub examples: &'a [RetrievedExample],
    /// Corrective feedback from the judge or QA gate.
    pub guidance: Option<&'a str>,
}

impl<'a> DraftRequest<'a> {
    /// Same request with different guidance.
    pub fn with_guidance(self, guidance: &'a str) -> Self {
        Self {
            guidance: Some(guidance),
            ..self
        }
    }
}

#[derive(Clone)]
pub struct DraftGenerator {
    gateway: Gateway,
}

impl DraftGenerator {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Generate one candidate. Provider errors and blank output are fatal.
    pub async fn generate(&self, request: &DraftRequest<'_>) -> Result<Generation, PipelineError> {
        let prompt = StagePrompt::for_stage(request.stage);
        let examples = format_examples(request.examples);
        let user = build_draft_prompt(
            &prompt,
            &DraftPromptInput {
                lead_name: request.lead_name,
                latest_message: request.latest_message,
                history: request.history,
                lead_context: request.lead_context,
                examples: &examples,
                guidance: request.guidance,
            },
        );

        let mut generation = self
            .gateway
            .generate(&prompt.system_prompt(), &user, DRAFT_PARAMS)
            .await?;

        let text = generation.text.trim();
        if text.is_empty() {
            return Err(PipelineError::EmptyDraft);
        }
        generation.text = text.to_string();

        info!(
            stage = %request.stage,
            model = %self.gateway.model_name(),
            guided = request.guidance.is_some(),
            chars = generation.text.len(),
            "Draft generated"
        );
        Ok(generation)
    }
}
