//! End-to-end pipeline runs: webhook → dispatcher → Gmail double → LLM
//! classifier → libSQL → label replication.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rust_decimal::Decimal;
use tower::ServiceExt;

use mail_assist::config::PipelineConfig;
use mail_assist::error::LlmError;
use mail_assist::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use mail_assist::pipeline::alert::{Alert, Alerter};
use mail_assist::pipeline::classifier::{ClassifierRegistry, LlmClassifier};
use mail_assist::pipeline::webhook::{WebhookState, routes};
use mail_assist::pipeline::{Dispatcher, MessagePipeline};
use mail_assist::providers::gmail::GmailAdapter;
use mail_assist::providers::{AdapterSet, ProviderKind, StaticCredentials};
use mail_assist::store::traits::{Account, RecordState};
use mail_assist::store::{Database, LibSqlBackend};

use common::{ACCESS_TOKEN, GmailState, start_gmail};

/// Maximum time a background batch may take before the test gives up.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const GOOD_REPLY: &str = r#"```json
{"topic": "work", "importance": "important", "answer": "Answer Required",
 "relevance": "Highly Relevant",
 "flags": {"spam": false, "scam": false, "newsletter": false, "notification": false, "meeting": false},
 "summary_one_line": "Status update", "summary_short": "A short status update."}
```"#;

/// LLM double answering every request with the same text.
struct ScriptedLlm {
    reply: String,
    calls: AtomicU32,
}

impl ScriptedLlm {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "claude-sonnet-4-20250514"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::new(3, 6), Decimal::new(15, 6))
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            content: self.reply.clone(),
            input_tokens: 120,
            output_tokens: 40,
        })
    }
}

#[derive(Default)]
struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

struct World {
    gmail: Arc<GmailState>,
    db: Arc<LibSqlBackend>,
    llm: Arc<ScriptedLlm>,
    alerter: Arc<RecordingAlerter>,
    account: Account,
    dispatcher: Dispatcher,
}

async fn world(reply: &str, workers: usize) -> World {
    let gmail = Arc::new(GmailState::default());
    let base = start_gmail(Arc::clone(&gmail)).await;

    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let account = Account::new("owner-1", ProviderKind::Gmail, "a@b.com", "cred");
    db.insert_account(&account).await.unwrap();
    db.add_category(&account.id, "Work", "Anything about the job")
        .await
        .unwrap();

    let credentials = Arc::new(StaticCredentials::new().with("cred", ACCESS_TOKEN));
    let adapters =
        AdapterSet::new().with(Arc::new(GmailAdapter::with_base_url(credentials.clone(), None, &base)));

    let llm = ScriptedLlm::new(reply);
    let classifiers =
        ClassifierRegistry::new().with(Arc::new(LlmClassifier::new("anthropic", llm.clone())));
    let alerter = Arc::new(RecordingAlerter::default());

    let pipeline = MessagePipeline::new(
        db.clone(),
        adapters,
        credentials,
        classifiers,
        alerter.clone(),
        PipelineConfig {
            workers,
            retry_backoff: Duration::from_millis(1),
            ..PipelineConfig::default()
        },
    );

    World {
        gmail,
        db,
        llm,
        alerter,
        account,
        dispatcher: Dispatcher::new(Arc::new(pipeline)),
    }
}

async fn wait_for_records(db: &LibSqlBackend, account_id: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let batch_done = db
            .list_accounts()
            .await
            .unwrap()
            .iter()
            .any(|a| a.id == account_id && a.cursor.is_some());
        if batch_done && db.count_records(account_id).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {expected} records");
}

fn push_request(address: &str) -> Request<Body> {
    let data = STANDARD.encode(format!(r#"{{"emailAddress":"{address}","historyId":"9876"}}"#));
    let body = serde_json::json!({ "message": { "data": data, "messageId": "42" } }).to_string();
    Request::post("/webhook/gmail")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

// ── Push scenario ───────────────────────────────────────────────────

#[tokio::test]
async fn push_persists_new_messages_and_resync_finds_nothing() {
    let w = world(GOOD_REPLY, 10).await;
    for i in 1..=3 {
        w.gmail.add_message(
            &format!("m-{i}"),
            "Alice <alice@example.com>",
            &format!("Update {i}"),
            "All good on my side.",
        );
    }

    let app = routes(WebhookState::new(w.dispatcher.clone(), None));
    let response = app.oneshot(push_request("a@b.com")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    wait_for_records(&w.db, &w.account.id, 3).await;

    for i in 1..=3 {
        let record = w
            .db
            .get_record_by_provider_id(&w.account.id, &format!("m-{i}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, RecordState::Classified);
        let classification = record.classification.unwrap();
        assert_eq!(classification.topic, "Work");
        assert_eq!(classification.summary_one_line, "Status update");
    }
    assert_eq!(w.gmail.modified.lock().unwrap().len(), 3);

    let report = w.dispatcher.synchronize(&w.account.id).await.unwrap();
    assert_eq!(report.processed_count, 0);
    assert_eq!(w.llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn usage_accumulates_across_messages() {
    let w = world(GOOD_REPLY, 4).await;
    for i in 0..5 {
        w.gmail.add_message(&format!("m-{i}"), "bob@example.com", "Hi", "Body");
    }

    let report = w.dispatcher.synchronize(&w.account.id).await.unwrap();
    assert_eq!(report.processed_count, 5);

    let usage = w.db.get_usage("owner-1").await.unwrap();
    assert_eq!(usage.input_tokens, 600);
    assert_eq!(usage.output_tokens, 200);
    assert_eq!(usage.calls, 5);
    assert!(usage.cost > Decimal::ZERO);

    let contacts = w.db.list_contacts("owner-1").await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].address, "bob@example.com");
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test]
async fn fifty_ids_through_ten_workers() {
    let w = world(GOOD_REPLY, 10).await;
    for i in 0..50 {
        w.gmail
            .add_message(&format!("m-{i:02}"), "carol@example.com", "Hello", "Text");
    }

    let report = w.dispatcher.synchronize(&w.account.id).await.unwrap();
    assert_eq!(report.processed_count, 50);
    assert!(report.errors.is_empty());
    assert_eq!(w.db.count_records(&w.account.id).await.unwrap(), 50);
    assert_eq!(w.gmail.fetches.load(Ordering::SeqCst), 50);
}

// ── Label replication ───────────────────────────────────────────────

#[tokio::test]
async fn labels_are_created_once_and_reused() {
    let w = world(GOOD_REPLY, 10).await;
    for i in 0..6 {
        w.gmail.add_message(&format!("m-{i}"), "dan@example.com", "Hi", "Body");
    }

    w.dispatcher.synchronize(&w.account.id).await.unwrap();

    let mut names = w.gmail.label_names();
    names.sort();
    assert_eq!(
        names,
        vec!["Answer Required", "Highly Relevant", "Work", "important_"]
    );
    assert_eq!(w.gmail.creates.load(Ordering::SeqCst), 4);

    let modified = w.gmail.modified.lock().unwrap().clone();
    assert_eq!(modified.len(), 6);
    assert!(modified.iter().all(|(_, ids)| ids.len() == 4 && *ids == modified[0].1));
    assert_eq!(w.db.get_cached_labels(&w.account.id).await.unwrap().len(), 4);
}

// ── Retry bound ─────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_ai_output_fails_after_three_attempts_with_one_alert() {
    let w = world("I'm not sure how to classify this one.", 10).await;
    w.gmail
        .add_message("m-1", "eve@example.com", "Puzzle", "What is this?");

    let report = w.dispatcher.synchronize(&w.account.id).await.unwrap();
    assert_eq!(report.processed_count, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(w.llm.calls.load(Ordering::SeqCst), 3);

    let alerts = w.alerter.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].attempts, 3);
    assert_eq!(alerts[0].message_id, "m-1");

    let record = w
        .db
        .get_record_by_provider_id(&w.account.id, "m-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, RecordState::Failed);
    assert!(record.last_error.unwrap().contains("JSON parse error"));
    assert!(w.gmail.modified.lock().unwrap().is_empty());

    // No automatic retry on the next pass.
    w.dispatcher.synchronize(&w.account.id).await.unwrap();
    assert_eq!(w.llm.calls.load(Ordering::SeqCst), 3);
    assert_eq!(w.alerter.alerts.lock().unwrap().len(), 1);
}
