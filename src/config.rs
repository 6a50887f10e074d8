//! Configuration types, built from environment variables with defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Reconciliation worker pool width.
    pub workers: usize,
    /// Classification attempts per message.
    pub max_attempts: u32,
    /// Base delay between classification attempts.
    pub retry_backoff: Duration,
    /// Upper bound on one message's pipeline run. Also the age after which a
    /// `PENDING` record is considered abandoned.
    pub message_timeout: Duration,
    /// Cron expression for background reconciliation; `None` disables it.
    pub reconcile_cron: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            message_timeout: Duration::from_secs(120),
            reconcile_cron: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("MAIL_ASSIST_WORKERS", defaults.workers).max(1),
            max_attempts: env_parse("MAIL_ASSIST_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            retry_backoff: Duration::from_millis(env_parse(
                "MAIL_ASSIST_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )),
            message_timeout: Duration::from_secs(env_parse(
                "MAIL_ASSIST_MESSAGE_TIMEOUT_SECS",
                defaults.message_timeout.as_secs(),
            )),
            reconcile_cron: env_opt("MAIL_ASSIST_RECONCILE_CRON"),
        }
    }
}

/// HTTP server and storage settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Bearer token for admin routes; admin routes are disabled when unset.
    pub admin_token: Option<SecretString>,
    pub log_dir: Option<PathBuf>,
    /// Pub/Sub topic for Gmail `watch()`.
    pub gmail_topic: Option<String>,
    /// Public URL of `/webhook/microsoft`, registered with Graph subscriptions.
    pub graph_notification_url: Option<String>,
    /// Shared secret Graph echoes in every notification.
    pub graph_client_state: Option<SecretString>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("MAIL_ASSIST_PORT", 8080),
            db_path: env_opt("MAIL_ASSIST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mail-assist.db")),
            admin_token: env_opt("MAIL_ASSIST_ADMIN_TOKEN").map(SecretString::from),
            log_dir: env_opt("MAIL_ASSIST_LOG_DIR").map(PathBuf::from),
            gmail_topic: env_opt("MAIL_ASSIST_GMAIL_TOPIC"),
            graph_notification_url: env_opt("MAIL_ASSIST_GRAPH_NOTIFICATION_URL"),
            graph_client_state: env_opt("MAIL_ASSIST_GRAPH_CLIENT_STATE").map(SecretString::from),
        }
    }
}

/// SMTP settings for operator alerts.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub recipients: Vec<String>,
}

impl AlertConfig {
    /// Returns `None` if `MAIL_ASSIST_ALERT_SMTP_HOST` or the recipient list
    /// is missing (alerts are then only logged).
    pub fn from_env() -> Option<Self> {
        let smtp_host = env_opt("MAIL_ASSIST_ALERT_SMTP_HOST")?;
        let recipients: Vec<String> = env_opt("MAIL_ASSIST_ALERT_TO")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if recipients.is_empty() {
            return None;
        }

        let username = env_opt("MAIL_ASSIST_ALERT_USERNAME").unwrap_or_default();
        Some(Self {
            smtp_host,
            smtp_port: env_parse("MAIL_ASSIST_ALERT_SMTP_PORT", 587),
            password: SecretString::from(env_opt("MAIL_ASSIST_ALERT_PASSWORD").unwrap_or_default()),
            from_address: env_opt("MAIL_ASSIST_ALERT_FROM").unwrap_or_else(|| username.clone()),
            username,
            recipients,
        })
    }
}

/// AI backends configured through API keys.
#[derive(Debug, Clone, Default)]
pub struct AiConfig {
    pub backends: Vec<LlmConfig>,
    /// Registry key of the default classifier.
    pub default_backend: Option<String>,
}

impl AiConfig {
    pub fn from_env() -> Self {
        let mut backends = Vec::new();
        if let Some(key) = env_opt("ANTHROPIC_API_KEY") {
            backends.push(LlmConfig {
                backend: LlmBackend::Anthropic,
                api_key: SecretString::from(key),
                model: env_opt("MAIL_ASSIST_ANTHROPIC_MODEL")
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            });
        }
        if let Some(key) = env_opt("OPENAI_API_KEY") {
            backends.push(LlmConfig {
                backend: LlmBackend::OpenAi,
                api_key: SecretString::from(key),
                model: env_opt("MAIL_ASSIST_OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            });
        }
        Self {
            backends,
            default_backend: env_opt("MAIL_ASSIST_DEFAULT_AI"),
        }
    }

    /// At least one backend is needed to classify anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "ANTHROPIC_API_KEY or OPENAI_API_KEY".to_string(),
                hint: "Set at least one AI provider key.".to_string(),
            });
        }
        if let Some(default) = &self.default_backend
            && !self.backends.iter().any(|b| b.backend.key() == default)
        {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_DEFAULT_AI".to_string(),
                message: format!("'{default}' has no API key configured"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.workers, 10);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.message_timeout, Duration::from_secs(120));
        assert!(config.reconcile_cron.is_none());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        assert_eq!(env_parse::<u16>("MAIL_ASSIST_TEST_UNSET_VAR", 42), 42);
    }

    #[test]
    fn ai_config_requires_a_backend() {
        assert!(matches!(
            AiConfig::default().validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn ai_config_default_must_be_configured() {
        let config = AiConfig {
            backends: vec![LlmConfig {
                backend: LlmBackend::Anthropic,
                api_key: SecretString::from("k"),
                model: "claude-sonnet-4-20250514".into(),
            }],
            default_backend: Some("openai".into()),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let ok = AiConfig {
            default_backend: Some("anthropic".into()),
            ..config
        };
        assert!(ok.validate().is_ok());
    }
}
