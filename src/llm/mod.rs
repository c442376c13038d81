//! LLM integration for reply-qc.
//!
//! Supports:
//! - **Anthropic**: Messages API, used for judging, QA, and learning
//! - **OpenAI-compatible**: chat-completions (DeepSeek by default), used for drafting
//!
//! Both are plain reqwest clients behind the `LlmProvider` trait. The pipeline
//! talks to them only through a `Gateway`.

mod anthropic;
pub mod gateway;
mod http;
mod openai;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use gateway::{Gateway, Generation, GenerationParams, decode_structured};
pub use openai::OpenAiCompatibleProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::{env_or, env_parse, env_secret};
use crate::error::{ConfigError, LlmError};

const DEFAULT_REVIEW_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_DRAFT_MODEL: &str = "deepseek-chat";
const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAiCompatible,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    /// Only used by the OpenAI-compatible backend.
    pub base_url: Option<String>,
    pub timeout: Duration,
}

/// Both model roles the pipeline needs.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Judge, QA gate, stage classifier, miner, consolidator.
    pub review: LlmConfig,
    /// Draft generation.
    pub draft: LlmConfig,
}

impl LlmSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let anthropic_key = env_secret("ANTHROPIC_API_KEY")?
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        let timeout = Duration::from_secs(env_parse("REPLY_QC_HTTP_TIMEOUT_SECS", 60u64)?);
        let review_model = env_or("REPLY_QC_REVIEW_MODEL", DEFAULT_REVIEW_MODEL);

        let review = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: anthropic_key.clone(),
            model: review_model.clone(),
            base_url: None,
            timeout,
        };

        let draft = match env_secret("DEEPSEEK_API_KEY")? {
            Some(key) => LlmConfig {
                backend: LlmBackend::OpenAiCompatible,
                api_key: key,
                model: env_or("REPLY_QC_DRAFT_MODEL", DEFAULT_DRAFT_MODEL),
                base_url: Some(env_or("DEEPSEEK_BASE_URL", DEFAULT_DEEPSEEK_BASE_URL)),
                timeout,
            },
            None => LlmConfig {
                backend: LlmBackend::Anthropic,
                api_key: anthropic_key,
                model: review_model,
                base_url: None,
                timeout,
            },
        };

        Ok(Self { review, draft })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => {
            let provider =
                AnthropicProvider::new(config.api_key.clone(), &config.model, config.timeout)?;
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(provider))
        }
        LlmBackend::OpenAiCompatible => {
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_DEEPSEEK_BASE_URL.to_string());
            tracing::info!(
                "Using OpenAI-compatible endpoint {} (model: {})",
                base_url,
                config.model
            );
            let provider = OpenAiCompatibleProvider::new(
                config.api_key.clone(),
                base_url,
                &config.model,
                config.timeout,
            )?;
            Ok(Arc::new(provider))
        }
    }
}
