//! Chat-completion backends behind the classifier.
//!
//! Each configured API key (Anthropic, OpenAI) yields one `LlmProvider`
//! built on rig-core; `RigAdapter` maps rig's completion model onto it.

pub mod costs;
pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Token usage from an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    /// Registry key used by accounts to pick this backend.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "anthropic")))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "openai")))
}
