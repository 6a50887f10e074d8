//! In-memory doubles for the pipeline's collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::PipelineConfig;
use crate::error::{LlmError, ProviderError};
use crate::llm::TokenUsage;
use crate::pipeline::alert::{Alert, Alerter};
use crate::pipeline::classifier::{Classifier, ClassifierRegistry};
use crate::pipeline::runner::MessagePipeline;
use crate::pipeline::types::{
    AnswerRequirement, BodyPart, Classification, ClassificationContext, ClassificationResult,
    Flags, Importance, Participant, RawMessage, Relevance,
};
use crate::providers::{
    AdapterSet, Cursor, LabelSpec, OutgoingMail, ProviderAdapter, ProviderKind, RemoteLabel,
    StaticCredentials, WatchSubscription,
};
use crate::store::libsql_backend::LibSqlBackend;
use crate::store::traits::{Account, Database};

pub fn raw_message(id: &str, sender: &str) -> RawMessage {
    RawMessage {
        provider_message_id: id.to_string(),
        subject: format!("Subject {id}"),
        sender: Participant::new(Some("Sender"), sender),
        cc: vec![Participant::new(None, "cc@example.com")],
        bcc: Vec::new(),
        body: BodyPart::Multipart {
            subtype: "alternative".into(),
            children: vec![
                BodyPart::Plain(format!("Hello, body of {id}.")),
                BodyPart::Html(format!("<p>Hello, body of {id}.</p>")),
            ],
        },
        sent_at: Utc::now(),
        is_reply: false,
        attachments: Vec::new(),
    }
}

/// Provider double holding messages and labels in memory.
pub struct MockMailbox {
    kind: ProviderKind,
    folders: bool,
    messages: Mutex<HashMap<String, RawMessage>>,
    labels: Mutex<Vec<RemoteLabel>>,
    pub fetches: AtomicU32,
    pub creates: AtomicU32,
    pub applied: Mutex<Vec<(String, Vec<String>)>>,
    pub moved: Mutex<Vec<(String, String)>>,
    pub fail_labels: AtomicBool,
    /// Next N fetches answer `AuthExpired`.
    pub auth_failures: AtomicU32,
    /// Next N label calls answer `AuthExpired`.
    pub label_auth_failures: AtomicU32,
    pub fetch_delay: Mutex<Duration>,
    pub label_delay: Mutex<Duration>,
    in_flight: AtomicU32,
    /// Highest number of fetches observed running at once.
    pub max_in_flight: AtomicU32,
    pub watches: AtomicU32,
}

impl MockMailbox {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            folders: false,
            messages: Mutex::new(HashMap::new()),
            labels: Mutex::new(Vec::new()),
            fetches: AtomicU32::new(0),
            creates: AtomicU32::new(0),
            applied: Mutex::new(Vec::new()),
            moved: Mutex::new(Vec::new()),
            fail_labels: AtomicBool::new(false),
            auth_failures: AtomicU32::new(0),
            label_auth_failures: AtomicU32::new(0),
            fetch_delay: Mutex::new(Duration::ZERO),
            label_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            watches: AtomicU32::new(0),
        }
    }

    pub fn with_folders(mut self) -> Self {
        self.folders = true;
        self
    }

    pub fn add_message(&self, raw: RawMessage) {
        self.messages
            .lock()
            .unwrap()
            .insert(raw.provider_message_id.clone(), raw);
    }

    pub fn add_remote_label(&self, id: &str, name: &str, color: Option<&str>) {
        self.labels.lock().unwrap().push(RemoteLabel {
            id: id.to_string(),
            name: name.to_string(),
            color: color.map(String::from),
        });
    }

    /// Delete a label on the "provider" side, as a user would.
    pub fn remove_remote_label(&self, name: &str) {
        self.labels.lock().unwrap().retain(|l| l.name != name);
    }

    pub fn remote_labels(&self) -> Vec<RemoteLabel> {
        self.labels.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicU32) -> Result<(), ProviderError> {
        if counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::AuthExpired {
                provider: "mock".into(),
                reason: "token expired".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for MockMailbox {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn fetch_by_id(&self, _account: &Account, id: &str) -> Result<RawMessage, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Self::take_failure(&self.auth_failures)?;
        self.messages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                provider: "mock".into(),
                id: id.to_string(),
            })
    }

    async fn fetch_ids_since(
        &self,
        _account: &Account,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<String>, ProviderError> {
        let since = cursor.and_then(Cursor::as_timestamp);
        let mut ids: Vec<String> = self
            .messages
            .lock()
            .unwrap()
            .values()
            .filter(|m| since.is_none_or(|t| m.sent_at >= t))
            .map(|m| m.provider_message_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_labels(&self, _account: &Account) -> Result<Vec<RemoteLabel>, ProviderError> {
        Self::take_failure(&self.label_auth_failures)?;
        let delay = *self.label_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_labels.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient {
                provider: "mock".into(),
                reason: "label API down".into(),
            });
        }
        Ok(self.remote_labels())
    }

    async fn create_label(
        &self,
        _account: &Account,
        spec: &LabelSpec,
    ) -> Result<RemoteLabel, ProviderError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let label = RemoteLabel {
            id: format!("Label_{n}"),
            name: spec.name.clone(),
            color: spec.color.clone(),
        };
        self.labels.lock().unwrap().push(label.clone());
        Ok(label)
    }

    async fn apply_labels(
        &self,
        _account: &Account,
        id: &str,
        label_ids: &[String],
    ) -> Result<(), ProviderError> {
        Self::take_failure(&self.label_auth_failures)?;
        let known: Vec<String> = self.remote_labels().into_iter().map(|l| l.id).collect();
        if let Some(missing) = label_ids.iter().find(|id| !known.contains(id)) {
            return Err(ProviderError::NotFound {
                provider: "mock".into(),
                id: missing.clone(),
            });
        }
        self.applied
            .lock()
            .unwrap()
            .push((id.to_string(), label_ids.to_vec()));
        Ok(())
    }

    async fn move_to_folder(
        &self,
        _account: &Account,
        id: &str,
        folder: &str,
    ) -> Result<(), ProviderError> {
        self.moved
            .lock()
            .unwrap()
            .push((id.to_string(), folder.to_string()));
        Ok(())
    }

    async fn send(&self, _account: &Account, _mail: &OutgoingMail) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn watch(&self, _account: &Account) -> Result<Option<WatchSubscription>, ProviderError> {
        let n = self.watches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(WatchSubscription {
            id: format!("sub-{n}"),
            expires_at: Some(Utc::now() + chrono::Duration::days(3)),
        }))
    }

    fn palette(&self) -> &'static [&'static str] {
        &["#111111", "#222222", "#333333"]
    }

    fn reserved_color(&self, name: &str) -> Option<&'static str> {
        (name == "important").then_some("#fb4c2f")
    }

    fn remote_label_name(&self, name: &str) -> String {
        if name == "spam" {
            "spam_".to_string()
        } else {
            name.to_string()
        }
    }

    fn supports_folders(&self) -> bool {
        self.folders
    }
}

pub fn classification(topic: &str) -> Classification {
    Classification {
        topic: topic.to_string(),
        importance: Importance::Important,
        answer: AnswerRequirement::Required,
        relevance: Relevance::High,
        flags: Flags::default(),
        summary_one_line: "One line".into(),
        summary_short: "Short summary.".into(),
    }
}

/// Classifier double: succeeds with a fixed result, or always fails.
pub struct StubClassifier {
    fail: AtomicBool,
    pub calls: AtomicU32,
}

impl StubClassifier {
    pub fn ok() -> Self {
        Self {
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        let stub = Self::ok();
        stub.fail.store(true, Ordering::SeqCst);
        stub
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    fn key(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-model"
    }

    async fn classify(
        &self,
        _subject: &str,
        _body: &str,
        context: &ClassificationContext,
    ) -> Result<ClassificationResult, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LlmError::InvalidResponse {
                provider: "stub".into(),
                reason: "malformed".into(),
            });
        }
        Ok(ClassificationResult {
            classification: classification(&context.resolve_topic("Work")),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            model: "stub-model".into(),
        })
    }
}

/// Alerter double that records every alert.
#[derive(Default)]
pub struct RecordingAlerter {
    pub alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

/// A pipeline over an in-memory database, one Gmail-kind mock mailbox and
/// one linked account (`me@example.com`, owner `owner-1`).
pub struct Fixture {
    pub db: Arc<LibSqlBackend>,
    pub mailbox: Arc<MockMailbox>,
    pub classifier: Arc<StubClassifier>,
    pub alerter: Arc<RecordingAlerter>,
    pub account: Account,
    pub pipeline: Arc<MessagePipeline>,
}

pub async fn fixture(classifier: StubClassifier) -> Fixture {
    fixture_with(classifier, PipelineConfig::default()).await
}

pub async fn fixture_with(classifier: StubClassifier, config: PipelineConfig) -> Fixture {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let account = Account::new("owner-1", ProviderKind::Gmail, "me@example.com", "cred");
    db.insert_account(&account).await.unwrap();

    let mailbox = Arc::new(MockMailbox::new(ProviderKind::Gmail));
    let classifier = Arc::new(classifier);
    let alerter = Arc::new(RecordingAlerter::default());
    let config = PipelineConfig {
        retry_backoff: Duration::ZERO,
        ..config
    };
    let pipeline = Arc::new(MessagePipeline::new(
        db.clone(),
        AdapterSet::new().with(mailbox.clone()),
        Arc::new(StaticCredentials::new().with("cred", "token")),
        ClassifierRegistry::new().with(classifier.clone()),
        alerter.clone(),
        config,
    ));
    Fixture {
        db,
        mailbox,
        classifier,
        alerter,
        account,
        pipeline,
    }
}
