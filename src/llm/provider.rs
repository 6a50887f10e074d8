//! Provider-neutral completion interface.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LlmError;

/// Chat role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Concatenated system messages, if any.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// A completion response with token accounting.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Anything that can turn a chat transcript into a completion.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier, e.g. `claude-sonnet-4-20250514`.
    fn model_name(&self) -> &str;

    /// `(input, output)` price per token in USD.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_joins_system_messages() {
        let req = CompletionRequest::new(vec![
            ChatMessage::system("a"),
            ChatMessage::user("question"),
            ChatMessage::system("b"),
        ])
        .with_temperature(0.1)
        .with_max_tokens(64);
        assert_eq!(req.system_prompt().as_deref(), Some("a\n\nb"));
        assert_eq!(req.max_tokens, Some(64));
    }

    #[test]
    fn no_system_prompt_when_absent() {
        let req = CompletionRequest::new(vec![ChatMessage::user("q")]);
        assert!(req.system_prompt().is_none());
    }
}
