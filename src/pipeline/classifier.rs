//! Classification: the AI provider contract, the LLM-backed classifier,
//! the per-account capability table and the bounded-retry orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{LlmError, PipelineError};
use crate::llm::TokenUsage;
use crate::llm::costs::call_cost;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{
    AnswerRequirement, Classification, ClassificationContext, ClassificationResult, Flags,
    Importance, Relevance,
};
use crate::store::traits::{Database, LlmCallRecord};

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 700;

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Body characters sent to the model.
const BODY_PREVIEW_CHARS: usize = 4000;

/// Anything that can classify a message. One implementation per AI backend.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Registry key (`anthropic`, `openai`, ...).
    fn key(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn classify(
        &self,
        subject: &str,
        body: &str,
        context: &ClassificationContext,
    ) -> Result<ClassificationResult, LlmError>;
}

// ── LLM-backed classifier ───────────────────────────────────────────

/// Classifier that prompts a chat model for a JSON object.
pub struct LlmClassifier {
    key: String,
    llm: Arc<dyn LlmProvider>,
}

impl LlmClassifier {
    pub fn new(key: &str, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            key: key.to_string(),
            llm,
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn key(&self) -> &str {
        &self.key
    }

    fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    async fn classify(
        &self,
        subject: &str,
        body: &str,
        context: &ClassificationContext,
    ) -> Result<ClassificationResult, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(context)),
            ChatMessage::user(build_user_prompt(subject, body, context)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let classification = parse_classification(&response.content, context).map_err(|reason| {
            LlmError::InvalidResponse {
                provider: self.key.clone(),
                reason,
            }
        })?;

        Ok(ClassificationResult {
            classification,
            usage: TokenUsage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
            },
            model: self.llm.model_name().to_string(),
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(context: &ClassificationContext) -> String {
    let list = |values: Vec<&str>| {
        values
            .into_iter()
            .map(|v| format!("\"{v}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut prompt = String::with_capacity(1024);
    prompt.push_str("You classify emails for the owner of the mailbox");
    if !context.mailbox_address.is_empty() {
        prompt.push_str(&format!(" {}", context.mailbox_address));
    }
    prompt.push_str(".\n\nTopics:\n");
    if context.categories.is_empty() {
        prompt.push_str("- (none defined, answer \"Others\")\n");
    }
    for (name, description) in &context.categories {
        if description.is_empty() {
            prompt.push_str(&format!("- {name}\n"));
        } else {
            prompt.push_str(&format!("- {name}: {description}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nRespond with ONLY a JSON object:\n\
         {{\"topic\": \"...\", \"importance\": \"...\", \"answer\": \"...\", \"relevance\": \"...\", \
         \"flags\": {{\"spam\": false, \"scam\": false, \"newsletter\": false, \"notification\": false, \"meeting\": false}}, \
         \"summary_one_line\": \"...\", \"summary_short\": \"...\"}}\n\n\
         - topic: one of the topics above, or \"Others\"\n\
         - importance: one of {}\n\
         - answer: one of {}\n\
         - relevance: one of {}\n\
         - summary_one_line: at most 12 words\n\
         - summary_short: at most 3 sentences",
        list(Importance::ALL.iter().map(|v| v.as_str()).collect()),
        list(AnswerRequirement::ALL.iter().map(|v| v.as_str()).collect()),
        list(Relevance::ALL.iter().map(|v| v.as_str()).collect()),
    ));
    prompt
}

fn build_user_prompt(subject: &str, body: &str, context: &ClassificationContext) -> String {
    let mut prompt = String::with_capacity(512);
    if let Some(sender) = &context.sender {
        prompt.push_str(&format!("From: {}", sender.address));
        if let Some(name) = &sender.name {
            prompt.push_str(&format!(" ({name})"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("Subject: {subject}\n"));
    if context.is_reply {
        prompt.push_str("This message is a reply in an existing thread.\n");
    }
    let preview: String = body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nMessage:\n{preview}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    #[serde(default)]
    topic: String,
    importance: String,
    answer: String,
    relevance: String,
    #[serde(default)]
    flags: FlagsResponse,
    #[serde(default)]
    summary_one_line: String,
    #[serde(default)]
    summary_short: String,
}

#[derive(Debug, Default, Deserialize)]
struct FlagsResponse {
    #[serde(default)]
    spam: bool,
    #[serde(default)]
    scam: bool,
    #[serde(default)]
    newsletter: bool,
    #[serde(default)]
    notification: bool,
    #[serde(default)]
    meeting: bool,
}

/// Parse model output into a `Classification`. Unknown enum values are errors.
fn parse_classification(raw: &str, context: &ClassificationContext) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: ClassificationResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let importance = Importance::parse(&response.importance)
        .ok_or_else(|| format!("unknown importance: '{}'", response.importance))?;
    let answer = AnswerRequirement::parse(&response.answer)
        .ok_or_else(|| format!("unknown answer requirement: '{}'", response.answer))?;
    let relevance = Relevance::parse(&response.relevance)
        .ok_or_else(|| format!("unknown relevance: '{}'", response.relevance))?;

    Ok(Classification {
        topic: context.resolve_topic(&response.topic),
        importance,
        answer,
        relevance,
        flags: Flags {
            spam: response.flags.spam,
            scam: response.flags.scam,
            newsletter: response.flags.newsletter,
            notification: response.flags.notification,
            meeting: response.flags.meeting,
        },
        summary_one_line: response.summary_one_line.trim().to_string(),
        summary_short: response.summary_short.trim().to_string(),
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

// ── Registry ────────────────────────────────────────────────────────

/// Capability table mapping a backend key to its classifier. Built once at startup.
#[derive(Clone, Default)]
pub struct ClassifierRegistry {
    classifiers: HashMap<String, Arc<dyn Classifier>>,
    default_key: Option<String>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a classifier. The first one registered becomes the default.
    pub fn register(&mut self, classifier: Arc<dyn Classifier>) {
        let key = classifier.key().to_string();
        if self.default_key.is_none() {
            self.default_key = Some(key.clone());
        }
        self.classifiers.insert(key, classifier);
    }

    pub fn with(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.register(classifier);
        self
    }

    pub fn set_default(&mut self, key: &str) -> Result<(), LlmError> {
        if !self.classifiers.contains_key(key) {
            return Err(LlmError::UnknownBackend(key.to_string()));
        }
        self.default_key = Some(key.to_string());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.classifiers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Classifier for an account's backend key. Unknown keys fall back to the default.
    pub fn resolve(&self, key: Option<&str>) -> Result<Arc<dyn Classifier>, LlmError> {
        if let Some(key) = key {
            if let Some(classifier) = self.classifiers.get(key) {
                return Ok(Arc::clone(classifier));
            }
            warn!(backend = %key, "Unknown AI backend, using default");
        }
        self.default_key
            .as_deref()
            .and_then(|k| self.classifiers.get(k))
            .cloned()
            .ok_or_else(|| LlmError::UnknownBackend(key.unwrap_or("default").to_string()))
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

/// Who the classification is billed to.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyTarget<'a> {
    pub owner_id: &'a str,
    pub record_id: &'a str,
}

/// Successful classification after `attempts` tries.
#[derive(Debug, Clone)]
pub struct Classified {
    pub classification: Classification,
    pub attempts: u32,
}

/// Calls a classifier with bounded retry and books token usage.
pub struct ClassificationOrchestrator {
    db: Arc<dyn Database>,
    max_attempts: u32,
    backoff: Duration,
}

impl ClassificationOrchestrator {
    pub fn new(db: Arc<dyn Database>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Try up to `max_attempts` times. Network errors and malformed responses
    /// both count as a failed attempt. Never retries beyond the bound.
    pub async fn classify(
        &self,
        classifier: &dyn Classifier,
        target: ClassifyTarget<'_>,
        subject: &str,
        body: &str,
        context: &ClassificationContext,
    ) -> Result<Classified, PipelineError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match classifier.classify(subject, body, context).await {
                Ok(result) => {
                    self.book_usage(classifier, target, &result).await;
                    debug!(
                        record = %target.record_id,
                        attempt,
                        topic = %result.classification.topic,
                        importance = result.classification.importance.as_str(),
                        "Message classified"
                    );
                    return Ok(Classified {
                        classification: result.classification,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(
                        record = %target.record_id,
                        backend = %classifier.key(),
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Classification attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
            }
        }

        error!(
            record = %target.record_id,
            attempts = self.max_attempts,
            error = %last_error,
            "Classification exhausted its attempts"
        );
        Err(PipelineError::Classification {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Exponential backoff (`backoff * 2^(attempt-1)`) plus up to 50% jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let base = (self.backoff.as_millis() as u64).saturating_mul(factor);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    /// Usage bookkeeping failures are logged; they never fail the message.
    async fn book_usage(
        &self,
        classifier: &dyn Classifier,
        target: ClassifyTarget<'_>,
        result: &ClassificationResult,
    ) {
        let cost = call_cost(
            &result.model,
            result.usage.input_tokens,
            result.usage.output_tokens,
        );
        if let Err(e) = self.db.add_usage(target.owner_id, &result.usage, cost).await {
            warn!(owner = %target.owner_id, error = %e, "Failed to add token usage");
        }
        let call = LlmCallRecord {
            owner_id: target.owner_id,
            record_id: Some(target.record_id),
            provider: classifier.key(),
            model: &result.model,
            usage: result.usage,
            cost,
            success: true,
        };
        if let Err(e) = self.db.record_llm_call(&call).await {
            warn!(owner = %target.owner_id, error = %e, "Failed to record LLM call");
        }
        info!(
            owner = %target.owner_id,
            input_tokens = result.usage.input_tokens,
            output_tokens = result.usage.output_tokens,
            cost = %cost,
            "Classification usage recorded"
        );
    }
}
