//! Per-message pipeline.
//!
//! Five stages, strictly sequential for one message:
//! 1. fetch (one credential refresh on `AuthExpired`)
//! 2. sender gating
//! 3. normalize
//! 4. idempotent persist as `PENDING`
//! 5. classify → `CLASSIFIED` + label replication, or `FAILED` + one alert
//!
//! Every error is mapped to a `ProcessOutcome` or returned for this message
//! only; nothing here aborts a batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ProviderError};
use crate::labels::LabelReplicator;
use crate::normalize::normalize;
use crate::pipeline::alert::{Alert, Alerter};
use crate::pipeline::classifier::{ClassificationOrchestrator, ClassifierRegistry, ClassifyTarget};
use crate::pipeline::rules::SenderRules;
use crate::pipeline::types::{
    Classification, ClassificationContext, Participant, ProcessOutcome,
};
use crate::providers::{AdapterSet, CredentialSource, ProviderAdapter, with_auth_refresh};
use crate::store::traits::{
    Account, Database, InsertOutcome, MessageRecord, NewRecord, RecordState,
};

/// Shared, immutable collaborators of every pipeline run.
pub struct MessagePipeline {
    db: Arc<dyn Database>,
    adapters: AdapterSet,
    credentials: Arc<dyn CredentialSource>,
    classifiers: ClassifierRegistry,
    orchestrator: ClassificationOrchestrator,
    labels: LabelReplicator,
    alerter: Arc<dyn Alerter>,
    config: PipelineConfig,
}

impl MessagePipeline {
    pub fn new(
        db: Arc<dyn Database>,
        adapters: AdapterSet,
        credentials: Arc<dyn CredentialSource>,
        classifiers: ClassifierRegistry,
        alerter: Arc<dyn Alerter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            orchestrator: ClassificationOrchestrator::new(
                Arc::clone(&db),
                config.max_attempts,
                config.retry_backoff,
            ),
            labels: LabelReplicator::new(Arc::clone(&db), Arc::clone(&credentials)),
            db,
            adapters,
            credentials,
            classifiers,
            alerter,
            config,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn credentials(&self) -> &dyn CredentialSource {
        self.credentials.as_ref()
    }

    pub fn adapter_for(&self, account: &Account) -> Result<Arc<dyn ProviderAdapter>, PipelineError> {
        self.adapters.get(account.provider).ok_or_else(|| {
            PipelineError::Fetch(ProviderError::Unsupported {
                provider: account.provider.to_string(),
                operation: "mail access (no adapter registered)".to_string(),
            })
        })
    }

    /// `PENDING` records untouched since this instant belong to a dead worker.
    pub fn stale_before(&self) -> chrono::DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.config.message_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        Utc::now() - timeout
    }

    /// `process`, bounded by the configured per-message timeout.
    pub async fn process_with_timeout(
        &self,
        account: &Account,
        message_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        let limit: Duration = self.config.message_timeout;
        match tokio::time::timeout(limit, self.process(account, message_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(account = %account.id, message = %message_id, ?limit, "Pipeline run timed out");
                Err(PipelineError::Timeout(limit))
            }
        }
    }

    /// Run all five stages for one remote message.
    pub async fn process(
        &self,
        account: &Account,
        message_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        let adapter = self.adapter_for(account)?;

        // 1. Fetch
        let source: &dyn ProviderAdapter = adapter.as_ref();
        let fetched = with_auth_refresh(self.credentials.as_ref(), account, move || {
            source.fetch_by_id(account, message_id)
        })
        .await;
        let raw = match fetched {
            Ok(raw) => raw,
            Err(ProviderError::NotFound { .. }) => {
                debug!(account = %account.id, message = %message_id, "Remote message gone, skipping");
                return Ok(ProcessOutcome::Skipped {
                    reason: "remote message not found".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        // 2. Sender gating
        let rules = SenderRules::new(self.db.list_sender_rules(&account.id).await?);
        if let Some(rule) = rules.blocking_rule(&raw.sender) {
            info!(
                account = %account.id,
                message = %message_id,
                sender = %raw.sender.address,
                "Sender blocked, not persisting"
            );
            return Ok(ProcessOutcome::Skipped {
                reason: format!("sender blocked by rule {rule}"),
            });
        }

        // 3. Normalize
        let message = normalize(&raw);

        // 4. Persist
        let new = NewRecord {
            account,
            message: &message,
            save_contact: SenderRules::should_save_contact(&message.sender),
        };
        let record_id = match self.db.insert_record(new).await? {
            InsertOutcome::Inserted { record_id } => record_id,
            InsertOutcome::AlreadyExists {
                record_id, state, ..
            } => {
                if state != RecordState::Pending
                    || !self.db.claim_stale_record(&record_id, self.stale_before()).await?
                {
                    debug!(account = %account.id, message = %message_id, "Already persisted");
                    return Ok(ProcessOutcome::AlreadyPresent);
                }
                info!(record = %record_id, message = %message_id, "Resuming abandoned pending record");
                record_id
            }
        };

        // 5. Classify
        let context = self
            .context_for(account, message.is_reply, Some(message.sender.clone()))
            .await?;
        let classified = self
            .classify(account, &record_id, &message.subject, &message.body, &context)
            .await;

        match classified {
            Ok((classification, attempts)) => {
                self.db
                    .mark_classified(&record_id, &classification, attempts)
                    .await?;
                self.after_classified(adapter.as_ref(), account, message_id, &classification)
                    .await;
                info!(
                    account = %account.id,
                    message = %message_id,
                    record = %record_id,
                    topic = %classification.topic,
                    "Message persisted"
                );
                Ok(ProcessOutcome::Persisted { record_id })
            }
            Err((attempts, last_error)) => {
                if self.db.mark_failed(&record_id, attempts, &last_error).await? {
                    self.alerter
                        .alert(&Alert {
                            account_id: account.id.clone(),
                            account_address: account.address.clone(),
                            provider: account.provider.to_string(),
                            message_id: message_id.to_string(),
                            attempts,
                            last_error: last_error.clone(),
                        })
                        .await;
                }
                Ok(ProcessOutcome::Failed {
                    record_id,
                    error: last_error,
                })
            }
        }
    }

    /// Re-classify a `FAILED` record from its stored content.
    ///
    /// Success moves it to `CLASSIFIED`; another failure only bumps its attempt
    /// count (no further alert).
    pub async fn retry_record(
        &self,
        account: &Account,
        record: &MessageRecord,
    ) -> Result<ProcessOutcome, PipelineError> {
        if record.state != RecordState::Failed {
            return Ok(ProcessOutcome::AlreadyPresent);
        }
        let adapter = self.adapter_for(account)?;
        let context = self
            .context_for(account, record.is_reply, Some(record.sender.clone()))
            .await?;

        match self
            .classify(account, &record.id, &record.subject, &record.body, &context)
            .await
        {
            Ok((classification, attempts)) => {
                let total = record.attempts + attempts;
                if !self.db.mark_classified(&record.id, &classification, total).await? {
                    return Ok(ProcessOutcome::AlreadyPresent);
                }
                self.after_classified(
                    adapter.as_ref(),
                    account,
                    &record.provider_message_id,
                    &classification,
                )
                .await;
                info!(record = %record.id, attempts = total, "Failed record recovered");
                Ok(ProcessOutcome::Persisted {
                    record_id: record.id.clone(),
                })
            }
            Err((attempts, last_error)) => {
                let total = record.attempts + attempts;
                self.db
                    .record_failed_retry(&record.id, total, &last_error)
                    .await?;
                error!(record = %record.id, attempts = total, error = %last_error, "Retry failed");
                Ok(ProcessOutcome::Failed {
                    record_id: record.id.clone(),
                    error: last_error,
                })
            }
        }
    }

    async fn context_for(
        &self,
        account: &Account,
        is_reply: bool,
        sender: Option<Participant>,
    ) -> Result<ClassificationContext, PipelineError> {
        Ok(ClassificationContext {
            mailbox_address: account.address.clone(),
            categories: self.db.list_categories(&account.id).await?,
            is_reply,
            sender,
        })
    }

    /// `(classification, attempts)` or `(attempts, last_error)`.
    async fn classify(
        &self,
        account: &Account,
        record_id: &str,
        subject: &str,
        body: &str,
        context: &ClassificationContext,
    ) -> Result<(Classification, u32), (u32, String)> {
        let classifier = self
            .classifiers
            .resolve(account.ai_backend.as_deref())
            .map_err(|e| (0, e.to_string()))?;
        let target = ClassifyTarget {
            owner_id: &account.owner_id,
            record_id,
        };
        match self
            .orchestrator
            .classify(classifier.as_ref(), target, subject, body, context)
            .await
        {
            Ok(done) => Ok((done.classification, done.attempts)),
            Err(PipelineError::Classification {
                attempts,
                last_error,
            }) => Err((attempts, last_error)),
            Err(other) => Err((self.orchestrator.max_attempts(), other.to_string())),
        }
    }

    /// Stats and label replication. Failures here never touch the record state.
    async fn after_classified(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        message_id: &str,
        classification: &Classification,
    ) {
        if let Err(e) = self
            .db
            .bump_classification_stats(&account.owner_id, classification)
            .await
        {
            warn!(owner = %account.owner_id, error = %e, "Failed to update classification stats");
        }
        if let Err(e) = self
            .labels
            .replicate(adapter, account, message_id, classification)
            .await
        {
            warn!(
                account = %account.id,
                message = %message_id,
                error = %e,
                "Label replication failed"
            );
        }
    }
}
