//! Error types for mail-assist.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Label error: {0}")]
    Label(#[from] LabelError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by a mailbox provider adapter.
///
/// Callers map each variant to one policy: `AuthExpired` gets one credential
/// refresh and one retry, `NotFound` is a skip, `Transient` is retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Credentials for {provider} expired: {reason}")]
    AuthExpired { provider: String, reason: String },

    #[error("Message {id} not found on {provider}")]
    NotFound { provider: String, id: String },

    #[error("Transient failure on {provider}: {reason}")]
    Transient { provider: String, reason: String },

    #[error("Unexpected response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("{provider} does not support {operation}")]
    Unsupported { provider: String, operation: String },
}

impl ProviderError {
    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Downgrade an auth failure that survived a refresh into a transient one.
    pub fn into_transient(self) -> Self {
        match self {
            Self::AuthExpired { provider, reason } => Self::Transient {
                provider,
                reason: format!("auth still rejected after refresh: {reason}"),
            },
            other => other,
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("No classifier registered under '{0}'")]
    UnknownBackend(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Label replication errors. Never fatal to a message.
#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("Provider rejected label operation: {0}")]
    Provider(#[from] ProviderError),

    #[error("Label cache error: {0}")]
    Database(#[from] DatabaseError),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No account found for {0}")]
    AccountNotFound(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] ProviderError),

    #[error("Classification failed after {attempts} attempts: {last_error}")]
    Classification { attempts: u32, last_error: String },

    #[error("Persistence failed: {0}")]
    Persist(#[from] DatabaseError),

    #[error("Invalid webhook payload: {0}")]
    Webhook(String),

    #[error("Pipeline timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
