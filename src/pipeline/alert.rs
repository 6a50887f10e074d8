//! Operator alerts for messages that exhausted their classification attempts.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{error, info};

use crate::config::AlertConfig;

pub const ALERT_SUBJECT: &str = "Critical Alert: Email Processing Failure";

/// What the operator is told about one failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub account_id: String,
    pub account_address: String,
    pub provider: String,
    pub message_id: String,
    pub attempts: u32,
    pub last_error: String,
}

impl Alert {
    pub fn body(&self) -> String {
        format!(
            "A message could not be classified and was marked FAILED.\n\n\
             Account:   {} ({})\n\
             Provider:  {}\n\
             Message:   {}\n\
             Attempts:  {}\n\
             Last error: {}\n\n\
             It will not be retried automatically. Use the retry-failed admin route once the cause is fixed.",
            self.account_address,
            self.account_id,
            self.provider,
            self.message_id,
            self.attempts,
            self.last_error,
        )
    }
}

/// Delivers operator alerts. Delivery failures are logged, never returned.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, alert: &Alert);
}

/// Alerts that only go to the log.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, alert: &Alert) {
        error!(
            account = %alert.account_address,
            provider = %alert.provider,
            message = %alert.message_id,
            attempts = alert.attempts,
            error = %alert.last_error,
            "{ALERT_SUBJECT}"
        );
    }
}

/// Alerts mailed to operators over SMTP.
pub struct SmtpAlerter {
    config: AlertConfig,
}

impl SmtpAlerter {
    pub fn new(config: AlertConfig) -> Self {
        Self { config }
    }

    fn build_message(config: &AlertConfig, alert: &Alert) -> Result<Message, String> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| format!("Invalid from address: {e}"))?;
        let mut builder = Message::builder().from(from).subject(ALERT_SUBJECT);
        for to in &config.recipients {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| format!("Invalid recipient {to}: {e}"))?;
            builder = builder.to(mailbox);
        }
        builder
            .body(alert.body())
            .map_err(|e| format!("Failed to build alert email: {e}"))
    }

    fn send_blocking(config: &AlertConfig, alert: &Alert) -> Result<(), String> {
        let email = Self::build_message(config, alert)?;
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| format!("SMTP relay error: {e}"))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        transport
            .send(&email)
            .map_err(|e| format!("SMTP send failed: {e}"))?;
        Ok(())
    }
}

#[async_trait]
impl Alerter for SmtpAlerter {
    async fn alert(&self, alert: &Alert) {
        LogAlerter.alert(alert).await;

        let config = self.config.clone();
        let owned = alert.clone();
        match tokio::task::spawn_blocking(move || Self::send_blocking(&config, &owned)).await {
            Ok(Ok(())) => info!(message = %alert.message_id, "Operator alert sent"),
            Ok(Err(e)) => error!(message = %alert.message_id, "Operator alert not sent: {e}"),
            Err(e) => error!(message = %alert.message_id, "Operator alert task panicked: {e}"),
        }
    }
}
