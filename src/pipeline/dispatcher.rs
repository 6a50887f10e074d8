//! Trigger Dispatcher: turns push notifications and reconciliation requests
//! into bounded-concurrency pipeline runs.
//!
//! Every pipeline run, whatever triggered it, takes a permit from one
//! semaphore sized by `workers`. Pushes for an account that is already
//! being synchronized are coalesced into a single follow-up run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::runner::MessagePipeline;
use crate::pipeline::types::{ProcessOutcome, SyncReport};
use crate::providers::{Cursor, WatchSubscription, with_auth_refresh};
use crate::store::traits::{Account, Database};

/// Subscriptions expiring within this window are renewed by `reconcile_all`.
const WATCH_RENEWAL_WINDOW_HOURS: i64 = 24;

/// Decoded push notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub email_address: String,
    /// Provider cursor carried by the push (Gmail `historyId`).
    pub cursor_token: String,
}

/// How a push was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    /// No linked account for the address.
    Ignored,
    /// A detached worker is synchronizing the account.
    Accepted { account_id: String },
}

impl PushAck {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Accepted { .. } => "accepted",
        }
    }
}

#[derive(Deserialize)]
struct PushEnvelope {
    message: PushEnvelopeMessage,
}

#[derive(Deserialize)]
struct PushEnvelopeMessage {
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload {
    email_address: String,
    history_id: serde_json::Value,
}

/// Decode `{"message":{"data": base64(JSON)}}`. Either base64 alphabet is
/// accepted, padded or not.
pub fn decode_push_envelope(body: &[u8]) -> Result<PushNotification, PipelineError> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Webhook(format!("envelope: {e}")))?;

    let normalized: String = envelope
        .message
        .data
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let decoded = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| PipelineError::Webhook(format!("data is not base64: {e}")))?;

    let payload: PushPayload = serde_json::from_slice(&decoded)
        .map_err(|e| PipelineError::Webhook(format!("payload: {e}")))?;
    let cursor_token = match payload.history_id {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(PipelineError::Webhook(format!(
                "historyId has unexpected type: {other}"
            )));
        }
    };
    if payload.email_address.trim().is_empty() {
        return Err(PipelineError::Webhook("empty emailAddress".to_string()));
    }

    Ok(PushNotification {
        email_address: payload.email_address.trim().to_lowercase(),
        cursor_token,
    })
}

/// One change notification from a Graph subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub subscription_id: String,
    pub client_state: Option<String>,
    pub change_type: ChangeType,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

#[derive(Deserialize)]
struct ChangeEnvelope {
    value: Vec<ChangeItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeItem {
    subscription_id: String,
    client_state: Option<String>,
    change_type: String,
    resource_data: Option<ChangeResourceData>,
}

#[derive(Deserialize)]
struct ChangeResourceData {
    id: String,
}

/// Decode `{"value":[{subscriptionId, clientState, changeType, resourceData:{id}}]}`.
pub fn decode_change_notifications(body: &[u8]) -> Result<Vec<ChangeNotification>, PipelineError> {
    let envelope: ChangeEnvelope = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Webhook(format!("notification: {e}")))?;

    envelope
        .value
        .into_iter()
        .map(|item| {
            let change_type = match item.change_type.as_str() {
                "created" => ChangeType::Created,
                "updated" => ChangeType::Updated,
                "deleted" => ChangeType::Deleted,
                other => {
                    return Err(PipelineError::Webhook(format!("unknown changeType: {other}")));
                }
            };
            let message_id = item
                .resource_data
                .map(|data| data.id)
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| PipelineError::Webhook("missing resourceData.id".to_string()))?;
            Ok(ChangeNotification {
                subscription_id: item.subscription_id,
                client_state: item.client_state,
                change_type,
                message_id,
            })
        })
        .collect()
}

/// Entry point for both trigger kinds. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<MessagePipeline>,
    /// Shared by every batch and single-message run.
    permits: Arc<Semaphore>,
    /// Accounts with a push-triggered run in flight; `true` when another
    /// push arrived meanwhile.
    pushes: Arc<Mutex<HashMap<String, bool>>>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<MessagePipeline>) -> Self {
        let workers = pipeline.config().workers.max(1);
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(workers)),
            pushes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    fn db(&self) -> &Arc<dyn Database> {
        self.pipeline.db()
    }

    async fn load_account(&self, account_id: &str) -> Result<Account, PipelineError> {
        self.db()
            .get_account(account_id)
            .await?
            .ok_or_else(|| PipelineError::AccountNotFound(account_id.to_string()))
    }

    /// Resolve the account and hand off to a detached worker. Never waits
    /// for the batch.
    pub async fn handle_push(&self, push: PushNotification) -> Result<PushAck, PipelineError> {
        let Some(account) = self.db().get_account_by_address(&push.email_address).await? else {
            info!(address = %push.email_address, "Push for unknown account, acknowledging");
            return Ok(PushAck::Ignored);
        };
        let account_id = account.id.clone();

        {
            let mut pushes = self.pushes.lock().await;
            if let Some(rerun) = pushes.get_mut(&account_id) {
                *rerun = true;
                debug!(account = %account_id, "Synchronization in flight, push coalesced");
                return Ok(PushAck::Accepted { account_id });
            }
            pushes.insert(account_id.clone(), false);
        }

        debug!(
            account = %account_id,
            cursor = %push.cursor_token,
            "Push accepted, dispatching worker"
        );
        let dispatcher = self.clone();
        let worker_account = account_id.clone();
        tokio::spawn(async move { dispatcher.drain_pushes(&worker_account).await });
        Ok(PushAck::Accepted { account_id })
    }

    /// Synchronize until no push arrived during the previous run.
    async fn drain_pushes(&self, account_id: &str) {
        loop {
            match self.synchronize(account_id).await {
                Ok(report) => info!(
                    account = %account_id,
                    processed = report.processed_count,
                    "Push batch complete"
                ),
                Err(e) => error!(account = %account_id, error = %e, "Push batch failed"),
            }

            let mut pushes = self.pushes.lock().await;
            match pushes.get_mut(account_id) {
                Some(rerun) if *rerun => *rerun = false,
                _ => {
                    pushes.remove(account_id);
                    return;
                }
            }
        }
    }

    /// Handle one Graph change notification. Created and updated messages
    /// are processed by a detached worker; deletions drop the local record.
    pub async fn handle_change(
        &self,
        change: ChangeNotification,
    ) -> Result<PushAck, PipelineError> {
        let Some(account) = self
            .db()
            .get_account_by_watch_id(&change.subscription_id)
            .await?
        else {
            info!(subscription = %change.subscription_id, "Notification for unknown subscription, acknowledging");
            return Ok(PushAck::Ignored);
        };
        let account_id = account.id.clone();

        if change.change_type == ChangeType::Deleted {
            let removed = self
                .db()
                .delete_record(&account.id, &change.message_id)
                .await?;
            info!(account = %account.id, message = %change.message_id, removed, "Remote message deleted");
            return Ok(PushAck::Accepted { account_id });
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = dispatcher.permits.acquire().await else {
                return;
            };
            match dispatcher
                .pipeline
                .process_with_timeout(&account, &change.message_id)
                .await
            {
                Ok(outcome) => debug!(account = %account.id, message = %change.message_id, ?outcome, "Notification processed"),
                Err(e) => warn!(account = %account.id, message = %change.message_id, error = %e, "Notification processing failed"),
            }
        });
        Ok(PushAck::Accepted { account_id })
    }

    /// Start (or renew) push notifications for an account and remember the
    /// subscription the provider returned.
    pub async fn watch(&self, account_id: &str) -> Result<Option<WatchSubscription>, PipelineError> {
        let account = self.load_account(account_id).await?;
        let adapter = self.pipeline.adapter_for(&account)?;
        let source = adapter.as_ref();
        let account = &account;
        let subscription = with_auth_refresh(self.pipeline.credentials(), account, move || {
            source.watch(account)
        })
        .await?;

        if let Some(ref sub) = subscription {
            self.db().set_watch(&account.id, Some(sub)).await?;
            info!(account = %account.id, subscription = %sub.id, "Push subscription stored");
        }
        Ok(subscription)
    }

    /// Stop push notifications and forget the stored subscription.
    pub async fn unwatch(&self, account_id: &str) -> Result<(), PipelineError> {
        let account = self.load_account(account_id).await?;
        let adapter = self.pipeline.adapter_for(&account)?;
        let source = adapter.as_ref();
        let account = &account;
        with_auth_refresh(self.pipeline.credentials(), account, move || {
            source.unwatch(account)
        })
        .await?;
        self.db().set_watch(&account.id, None).await?;
        Ok(())
    }

    /// Reconcile one account: process every remote id since the cursor that
    /// is not yet persisted.
    pub async fn synchronize(&self, account_id: &str) -> Result<SyncReport, PipelineError> {
        let account = self.load_account(account_id).await?;
        self.synchronize_account(&account).await
    }

    pub async fn synchronize_account(&self, account: &Account) -> Result<SyncReport, PipelineError> {
        let batch_start = Utc::now();
        let adapter = self.pipeline.adapter_for(account)?;
        let source = adapter.as_ref();
        let remote = with_auth_refresh(self.pipeline.credentials(), account, move || {
            source.fetch_ids_since(account, account.cursor.as_ref())
        })
        .await?;

        let persisted = self
            .db()
            .persisted_ids(&account.id, self.pipeline.stale_before())
            .await?;
        let mut seen = HashSet::new();
        let missing: Vec<String> = remote
            .iter()
            .filter(|id| !persisted.contains(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect();

        info!(
            account = %account.id,
            remote = remote.len(),
            missing = missing.len(),
            "Reconciling account"
        );

        let report = self.run_batch(account, missing).await;

        match self.cursor_hold(account, &remote, &report).await {
            None => match self
                .db()
                .update_cursor(&account.id, &Cursor::Timestamp(batch_start))
                .await
            {
                Ok(true) => debug!(account = %account.id, cursor = %batch_start, "Cursor advanced"),
                Ok(false) => {}
                Err(e) => warn!(account = %account.id, error = %e, "Failed to store cursor"),
            },
            Some(reason) => warn!(account = %account.id, reason = %reason, "Cursor left unchanged"),
        }

        info!(
            account = %account.id,
            processed = report.processed_count,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Why the cursor must not move past this batch, if it must not.
    ///
    /// Per-item errors hold it, and so does any listed id still `PENDING`
    /// (owned by a concurrent run that may yet die).
    async fn cursor_hold(
        &self,
        account: &Account,
        remote: &[String],
        report: &SyncReport,
    ) -> Option<String> {
        if !report.errors.is_empty() {
            return Some(format!("{} per-item errors", report.errors.len()));
        }
        match self.db().pending_ids(&account.id).await {
            Ok(pending) => {
                let unfinished = remote.iter().filter(|id| pending.contains(*id)).count();
                (unfinished > 0).then(|| format!("{unfinished} messages still pending"))
            }
            Err(e) => Some(format!("pending check failed: {e}")),
        }
    }

    /// Synchronize every linked account in turn, renewing push subscriptions
    /// close to expiry. Returns the total number of newly persisted messages.
    pub async fn reconcile_all(&self) -> usize {
        let accounts = match self.db().list_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "Failed to list accounts for reconciliation");
                return 0;
            }
        };

        let renew_before = Utc::now() + Duration::hours(WATCH_RENEWAL_WINDOW_HOURS);
        let mut total = 0;
        for account in &accounts {
            if account
                .watch_expires_at
                .is_some_and(|expires| expires < renew_before)
            {
                if let Err(e) = self.watch(&account.id).await {
                    warn!(account = %account.id, error = %e, "Failed to renew push subscription");
                }
            }
            match self.synchronize_account(account).await {
                Ok(report) => total += report.processed_count,
                Err(e) => error!(account = %account.id, error = %e, "Reconciliation failed"),
            }
        }
        total
    }

    /// Re-classify the account's `FAILED` records from their stored content.
    pub async fn retry_failed(&self, account_id: &str) -> Result<SyncReport, PipelineError> {
        let account = self.load_account(account_id).await?;
        let records = self.db().failed_records(&account.id).await?;
        info!(account = %account.id, count = records.len(), "Retrying failed records");

        let limit = self.pipeline.config().message_timeout;
        let mut report = SyncReport::default();
        for record in &records {
            let result =
                tokio::time::timeout(limit, self.pipeline.retry_record(&account, record)).await;
            match result {
                Ok(Ok(outcome)) => tally(&mut report, outcome),
                Ok(Err(e)) => report.errors.push((record.provider_message_id.clone(), e.to_string())),
                Err(_) => report.errors.push((
                    record.provider_message_id.clone(),
                    PipelineError::Timeout(limit).to_string(),
                )),
            }
        }
        Ok(report)
    }

    /// Process `ids` under the shared worker bound. A failing run is recorded
    /// and never cancels its siblings.
    async fn run_batch(&self, account: &Account, ids: Vec<String>) -> SyncReport {
        let mut workers = JoinSet::new();

        for id in ids {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let pipeline = Arc::clone(&self.pipeline);
            let account = account.clone();
            workers.spawn(async move {
                let _permit = permit;
                let result = pipeline.process_with_timeout(&account, &id).await;
                (id, result)
            });
        }

        let mut report = SyncReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => tally(&mut report, outcome),
                Ok((id, Err(e))) => {
                    warn!(account = %account.id, message = %id, error = %e, "Message failed");
                    report.errors.push((id, e.to_string()));
                }
                Err(e) => {
                    error!(account = %account.id, error = %e, "Pipeline worker panicked");
                    report.errors.push((String::new(), e.to_string()));
                }
            }
        }
        report
    }
}

fn tally(report: &mut SyncReport, outcome: ProcessOutcome) {
    match outcome {
        ProcessOutcome::Persisted { .. } => report.processed_count += 1,
        ProcessOutcome::AlreadyPresent => {}
        ProcessOutcome::Skipped { .. } => report.skipped += 1,
        ProcessOutcome::Failed { .. } => report.failed += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD;

    use crate::config::PipelineConfig;
    use crate::normalize::normalize;
    use crate::store::traits::{NewRecord, RecordState};
    use crate::testing::{Fixture, StubClassifier, fixture, fixture_with, raw_message};

    async fn wait_for_records(f: &Fixture, expected: usize) {
        for _ in 0..250 {
            if f.db.count_records(&f.account.id).await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn two_workers() -> PipelineConfig {
        PipelineConfig {
            workers: 2,
            ..PipelineConfig::default()
        }
    }

    fn envelope(payload: &str, encode: impl Fn(&[u8]) -> String) -> Vec<u8> {
        serde_json::json!({
            "message": { "data": encode(payload.as_bytes()), "messageId": "1" },
            "subscription": "projects/p/subscriptions/s"
        })
        .to_string()
        .into_bytes()
    }

    // ── Envelope tests ──────────────────────────────────────────────

    #[test]
    fn decodes_standard_and_url_safe_envelopes() {
        let payload = r#"{"emailAddress":"A@B.com","historyId":4242}"#;
        let standard = envelope(payload, |b| STANDARD.encode(b));
        let url_safe = envelope(payload, |b| URL_SAFE_NO_PAD.encode(b));

        for body in [standard, url_safe] {
            let push = decode_push_envelope(&body).unwrap();
            assert_eq!(push.email_address, "a@b.com");
            assert_eq!(push.cursor_token, "4242");
        }
    }

    #[test]
    fn string_history_id_is_accepted() {
        let body = envelope(r#"{"emailAddress":"a@b.com","historyId":"77"}"#, |b| {
            STANDARD.encode(b)
        });
        assert_eq!(decode_push_envelope(&body).unwrap().cursor_token, "77");
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        assert!(decode_push_envelope(b"not json").is_err());
        assert!(decode_push_envelope(br#"{"message":{"data":"%%%"}}"#).is_err());

        let missing_address = envelope(r#"{"historyId":1}"#, |b| STANDARD.encode(b));
        assert!(matches!(
            decode_push_envelope(&missing_address),
            Err(PipelineError::Webhook(_))
        ));
    }

    // ── Push tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn push_for_unknown_account_is_ignored() {
        let f = fixture(StubClassifier::ok()).await;
        let dispatcher = Dispatcher::new(f.pipeline.clone());
        let ack = dispatcher
            .handle_push(PushNotification {
                email_address: "nobody@example.com".into(),
                cursor_token: "1".into(),
            })
            .await
            .unwrap();
        assert_eq!(ack, PushAck::Ignored);
        assert_eq!(ack.status(), "ignored");
    }

    #[tokio::test]
    async fn push_returns_before_the_batch_finishes() {
        let f = fixture(StubClassifier::ok()).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));
        *f.mailbox.fetch_delay.lock().unwrap() = Duration::from_millis(300);
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let ack = dispatcher
            .handle_push(PushNotification {
                email_address: "me@example.com".into(),
                cursor_token: "9".into(),
            })
            .await
            .unwrap();
        assert!(matches!(ack, PushAck::Accepted { .. }));
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn push_burst_is_coalesced_and_bounded() {
        let f = fixture_with(StubClassifier::ok(), two_workers()).await;
        for i in 0..20 {
            f.mailbox.add_message(raw_message(&format!("m-{i:02}"), "alice@example.com"));
        }
        *f.mailbox.fetch_delay.lock().unwrap() = Duration::from_millis(20);
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        for n in 0..5 {
            let ack = dispatcher
                .handle_push(PushNotification {
                    email_address: "me@example.com".into(),
                    cursor_token: n.to_string(),
                })
                .await
                .unwrap();
            assert!(matches!(ack, PushAck::Accepted { .. }));
        }

        wait_for_records(&f, 20).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 20);
        assert_eq!(f.mailbox.fetches.load(Ordering::SeqCst), 20);
        assert!(f.mailbox.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(dispatcher.pushes.lock().await.is_empty());
    }

    // ── Reconciliation tests ────────────────────────────────────────

    #[tokio::test]
    async fn synchronize_processes_only_missing_ids() {
        let f = fixture(StubClassifier::ok()).await;
        for i in 0..3 {
            f.mailbox.add_message(raw_message(&format!("m-{i}"), "alice@example.com"));
        }
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let first = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(first.processed_count, 3);

        let second = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(second.processed_count, 0);
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cursor_advances_after_a_clean_batch() {
        let f = fixture(StubClassifier::ok()).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let before = Utc::now();
        dispatcher.synchronize(&f.account.id).await.unwrap();

        let account = f.db.get_account(&f.account.id).await.unwrap().unwrap();
        let cursor = account.cursor.and_then(|c| c.as_timestamp()).unwrap();
        assert!(cursor >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn per_item_errors_keep_cursor_and_siblings() {
        let config = PipelineConfig {
            workers: 1,
            ..PipelineConfig::default()
        };
        let f = fixture_with(StubClassifier::ok(), config).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));
        f.mailbox.add_message(raw_message("m-2", "bob@example.com"));
        f.mailbox.auth_failures.store(2, Ordering::SeqCst);
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let report = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.processed_count, 1);

        let account = f.db.get_account(&f.account.id).await.unwrap().unwrap();
        assert!(account.cursor.is_none());
    }

    #[tokio::test]
    async fn fifty_ids_through_ten_workers_yield_fifty_records() {
        let f = fixture(StubClassifier::ok()).await;
        for i in 0..50 {
            f.mailbox.add_message(raw_message(&format!("m-{i:02}"), "alice@example.com"));
        }
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let report = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(report.processed_count, 50);
        assert!(report.errors.is_empty());
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn concurrent_synchronize_never_duplicates() {
        let f = fixture(StubClassifier::ok()).await;
        for i in 0..20 {
            f.mailbox.add_message(raw_message(&format!("m-{i:02}"), "alice@example.com"));
        }
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let (a, b) = tokio::join!(
            dispatcher.synchronize(&f.account.id),
            dispatcher.synchronize(&f.account.id)
        );
        assert_eq!(a.unwrap().processed_count + b.unwrap().processed_count, 20);
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn concurrent_batches_share_the_worker_bound() {
        let f = fixture_with(StubClassifier::ok(), two_workers()).await;
        for i in 0..10 {
            f.mailbox.add_message(raw_message(&format!("m-{i:02}"), "alice@example.com"));
        }
        *f.mailbox.fetch_delay.lock().unwrap() = Duration::from_millis(30);
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let (a, b) = tokio::join!(
            dispatcher.synchronize(&f.account.id),
            dispatcher.synchronize(&f.account.id)
        );
        assert_eq!(a.unwrap().processed_count + b.unwrap().processed_count, 10);
        assert!(f.mailbox.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn fresh_pending_record_holds_the_cursor_until_resumed() {
        let config = PipelineConfig {
            message_timeout: Duration::from_millis(300),
            ..PipelineConfig::default()
        };
        let f = fixture_with(StubClassifier::ok(), config).await;
        let raw = raw_message("m-1", "alice@example.com");
        f.mailbox.add_message(raw.clone());
        let message = normalize(&raw);
        f.db.insert_record(NewRecord {
            account: &f.account,
            message: &message,
            save_contact: false,
        })
        .await
        .unwrap();
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let report = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(report.processed_count, 0);
        assert!(report.errors.is_empty());
        let account = f.db.get_account(&f.account.id).await.unwrap().unwrap();
        assert!(account.cursor.is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let resumed = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(resumed.processed_count, 1);

        let record = f
            .db
            .get_record_by_provider_id(&f.account.id, "m-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, RecordState::Classified);
        let account = f.db.get_account(&f.account.id).await.unwrap().unwrap();
        assert!(account.cursor.is_some());
    }

    #[tokio::test]
    async fn unknown_account_is_an_error() {
        let f = fixture(StubClassifier::ok()).await;
        let err = Dispatcher::new(f.pipeline.clone())
            .synchronize("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_account() {
        let f = fixture(StubClassifier::ok()).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        assert_eq!(dispatcher.reconcile_all().await, 1);
        assert_eq!(dispatcher.reconcile_all().await, 0);
    }

    #[tokio::test]
    async fn reconcile_all_renews_expiring_subscriptions() {
        let f = fixture(StubClassifier::ok()).await;
        let soon = WatchSubscription {
            id: "sub-old".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
        };
        f.db.set_watch(&f.account.id, Some(&soon)).await.unwrap();
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        dispatcher.reconcile_all().await;
        assert_eq!(f.mailbox.watches.load(Ordering::SeqCst), 1);
        let account = f.db.get_account(&f.account.id).await.unwrap().unwrap();
        assert_eq!(account.watch_id.as_deref(), Some("sub-1"));

        dispatcher.reconcile_all().await;
        assert_eq!(f.mailbox.watches.load(Ordering::SeqCst), 1);
    }

    // ── Change notification tests ───────────────────────────────────

    fn change_body(change_type: &str, id: &str) -> Vec<u8> {
        serde_json::json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "shared",
                "changeType": change_type,
                "resource": format!("Users/u/Messages/{id}"),
                "resourceData": { "@odata.type": "#Microsoft.Graph.Message", "id": id }
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn decodes_change_notifications() {
        let changes = decode_change_notifications(&change_body("created", "AAMk1")).unwrap();
        assert_eq!(
            changes,
            vec![ChangeNotification {
                subscription_id: "sub-1".into(),
                client_state: Some("shared".into()),
                change_type: ChangeType::Created,
                message_id: "AAMk1".into(),
            }]
        );
        assert!(decode_change_notifications(&change_body("moved", "x")).is_err());
        assert!(decode_change_notifications(br#"{"value":[{"subscriptionId":"s","changeType":"created"}]}"#).is_err());
    }

    #[tokio::test]
    async fn watch_stores_the_subscription_and_unwatch_clears_it() {
        let f = fixture(StubClassifier::ok()).await;
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let sub = dispatcher.watch(&f.account.id).await.unwrap().unwrap();
        assert_eq!(sub.id, "sub-1");
        let found = f.db.get_account_by_watch_id("sub-1").await.unwrap().unwrap();
        assert_eq!(found.id, f.account.id);

        dispatcher.unwatch(&f.account.id).await.unwrap();
        assert!(f.db.get_account_by_watch_id("sub-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn created_change_processes_one_message_and_deleted_removes_it() {
        let f = fixture(StubClassifier::ok()).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));
        f.mailbox.add_message(raw_message("m-2", "bob@example.com"));
        let dispatcher = Dispatcher::new(f.pipeline.clone());
        dispatcher.watch(&f.account.id).await.unwrap();

        let created = decode_change_notifications(&change_body("created", "m-1")).unwrap();
        let ack = dispatcher.handle_change(created[0].clone()).await.unwrap();
        assert!(matches!(ack, PushAck::Accepted { .. }));
        wait_for_records(&f, 1).await;
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 1);
        assert_eq!(f.mailbox.fetches.load(Ordering::SeqCst), 1);

        let deleted = decode_change_notifications(&change_body("deleted", "m-1")).unwrap();
        dispatcher.handle_change(deleted[0].clone()).await.unwrap();
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn change_for_unknown_subscription_is_ignored() {
        let f = fixture(StubClassifier::ok()).await;
        let dispatcher = Dispatcher::new(f.pipeline.clone());
        let change = decode_change_notifications(&change_body("created", "m-1")).unwrap();
        let ack = dispatcher.handle_change(change[0].clone()).await.unwrap();
        assert_eq!(ack, PushAck::Ignored);
    }

    // ── Retry tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_records_are_left_alone_until_retried() {
        let f = fixture(StubClassifier::failing()).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));
        let dispatcher = Dispatcher::new(f.pipeline.clone());

        let report = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed_count, 0);

        let again = dispatcher.synchronize(&f.account.id).await.unwrap();
        assert_eq!(again.failed, 0);
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 3);

        f.classifier.set_failing(false);
        let retried = dispatcher.retry_failed(&f.account.id).await.unwrap();
        assert_eq!(retried.processed_count, 1);

        let record = f
            .db
            .get_record_by_provider_id(&f.account.id, "m-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, RecordState::Classified);
        assert_eq!(f.alerter.alerts.lock().unwrap().len(), 1);
    }
}
