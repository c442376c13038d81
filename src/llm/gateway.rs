//! Process-wide gateway over one provider: a text call and a strict JSON call.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::error::PipelineError;

/// Sampling parameters for a single call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationParams {
    pub const fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Text returned by the model plus usage bookkeeping.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: Decimal,
}

/// Cheap to clone; every clone shares the same provider.
#[derive(Clone)]
pub struct Gateway {
    provider: Arc<dyn LlmProvider>,
}

impl Gateway {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Single-attempt text generation.
    pub async fn generate(
        &self,
        system: &str,
        user: &str,
        params: GenerationParams,
    ) -> Result<Generation, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ])
        .with_max_tokens(params.max_tokens)
        .with_temperature(params.temperature);

        let response = self.provider.complete(request).await?;
        let (input_price, output_price) = self.provider.cost_per_token();
        let cost_usd = input_price * Decimal::from(response.input_tokens)
            + output_price * Decimal::from(response.output_tokens);

        debug!(
            model = %self.provider.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost_usd = %cost_usd,
            "LLM call complete"
        );

        Ok(Generation {
            text: response.content,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost_usd,
        })
    }

    /// Generation whose output must decode as `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        params: GenerationParams,
    ) -> Result<(T, Generation), PipelineError> {
        let generation = self.generate(system, user, params).await?;
        let value = decode_structured(&generation.text)?;
        Ok((value, generation))
    }
}

/// Decode a JSON payload, stripping at most one surrounding markdown fence.
///
/// Anything other than bare JSON or a single well-formed fence around JSON is
/// rejected: no prose scanning, no brace hunting.
pub fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T, PipelineError> {
    let body = strip_fence(raw)?;
    serde_json::from_str(body)
        .map_err(|e| PipelineError::Parse(format!("Invalid JSON: {e}")))
}

fn strip_fence(raw: &str) -> Result<&str, PipelineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Parse("Empty response".to_string()));
    }

    let Some(after_open) = trimmed.strip_prefix("```") else {
        return Ok(trimmed);
    };

    let Some(newline) = after_open.find('\n') else {
        return Err(PipelineError::Parse("Unterminated code fence".to_string()));
    };
    let tag = after_open[..newline].trim();
    if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(PipelineError::Parse(format!("Malformed fence tag: '{tag}'")));
    }

    let rest = &after_open[newline + 1..];
    let Some(inner) = rest.trim_end().strip_suffix("```") else {
        return Err(PipelineError::Parse("Unterminated code fence".to_string()));
    };
    if inner.contains("```") {
        return Err(PipelineError::Parse("Multiple code fences".to_string()));
    }

    let inner = inner.trim();
    if inner.is_empty() {
        return Err(PipelineError::Parse("Empty code fence".to_string()));
    }
    Ok(inner)
}
