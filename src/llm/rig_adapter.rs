//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};

/// Wraps any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }

    fn map_error(&self, err: CompletionError) -> LlmError {
        let reason = err.to_string();
        let lower = reason.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") {
            LlmError::RateLimited {
                provider: self.provider.to_string(),
                retry_after: None,
            }
        } else if lower.contains("401") || lower.contains("unauthorized") {
            LlmError::AuthFailed {
                provider: self.provider.to_string(),
            }
        } else {
            LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason,
            }
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut turns: Vec<Message> = request
            .messages
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(Message::user(m.content.clone())),
                Role::Assistant => Some(Message::assistant(m.content.clone())),
                Role::System => None,
            })
            .collect();

        let prompt = turns.pop().ok_or_else(|| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: "completion request has no user message".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(turns);
        if let Some(system) = request.system_prompt() {
            builder = builder.preamble(system);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(f64::from(t));
        }
        if let Some(max) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max));
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        tracing::debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
        })
    }
}
