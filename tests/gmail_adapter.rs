//! Gmail adapter against an in-process API double.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{TimeZone, Utc};
use serde_json::json;

use mail_assist::error::ProviderError;
use mail_assist::normalize::normalize;
use mail_assist::providers::gmail::GmailAdapter;
use mail_assist::providers::{Cursor, LabelSpec, ProviderAdapter, ProviderKind, StaticCredentials};
use mail_assist::store::traits::Account;

use common::{ACCESS_TOKEN, GmailState, start_gmail};

async fn setup() -> (Arc<GmailState>, GmailAdapter, Account) {
    let state = Arc::new(GmailState::default());
    let base = start_gmail(Arc::clone(&state)).await;
    let credentials = Arc::new(StaticCredentials::new().with("cred", ACCESS_TOKEN));
    let adapter = GmailAdapter::with_base_url(credentials, None, &base);
    let account = Account::new("owner", ProviderKind::Gmail, "a@b.com", "cred");
    (state, adapter, account)
}

// ── Fetch tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_by_id_builds_raw_message() {
    let (state, adapter, account) = setup().await;
    state.add_message("m-1", "Alice <alice@example.com>", "Quarterly report", "Numbers attached.");

    let raw = adapter.fetch_by_id(&account, "m-1").await.unwrap();
    assert_eq!(raw.provider_message_id, "m-1");
    assert_eq!(raw.subject, "Quarterly report");
    assert_eq!(raw.sender.address, "alice@example.com");
    assert_eq!(raw.sender.name.as_deref(), Some("Alice"));
    assert_eq!(raw.cc.len(), 2);
    assert!(!raw.is_reply);
    assert_eq!(raw.sent_at, Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap());

    let normalized = normalize(&raw);
    assert_eq!(normalized.body, "Numbers attached.");
}

#[tokio::test]
async fn reply_header_and_attachments_are_absorbed() {
    let (state, adapter, account) = setup().await;
    state.add_raw(
        "m-2",
        json!({
            "id": "m-2",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    { "name": "Subject", "value": "Re: invoice" },
                    { "name": "From", "value": "bob@example.com" },
                    { "name": "In-Reply-To", "value": "<abc@mail.example.com>" }
                ],
                "parts": [
                    { "mimeType": "text/html", "body": { "data": URL_SAFE_NO_PAD.encode("<p>See&nbsp;file</p>") } },
                    { "mimeType": "application/pdf", "filename": "invoice.pdf", "body": { "attachmentId": "att-1" } }
                ]
            }
        }),
    );

    let raw = adapter.fetch_by_id(&account, "m-2").await.unwrap();
    assert!(raw.is_reply);
    assert_eq!(raw.attachments.len(), 1);
    assert_eq!(raw.attachments[0].filename, "invoice.pdf");
    assert_eq!(raw.attachments[0].provider_attachment_id.as_deref(), Some("att-1"));

    let normalized = normalize(&raw);
    assert!(normalized.has_attachments);
    assert_eq!(normalized.body, "See file");
}

#[tokio::test]
async fn missing_message_is_not_found() {
    let (_state, adapter, account) = setup().await;
    let err = adapter.fetch_by_id(&account, "deleted").await.unwrap_err();
    assert!(matches!(err, ProviderError::NotFound { .. }));
}

#[tokio::test]
async fn rejected_token_is_auth_expired() {
    let (_state, adapter, account) = setup().await;
    let err = adapter.fetch_by_id(&account, "revoked").await.unwrap_err();
    assert!(matches!(err, ProviderError::AuthExpired { .. }));
}

#[tokio::test]
async fn unreachable_server_is_transient() {
    let credentials = Arc::new(StaticCredentials::new().with("cred", ACCESS_TOKEN));
    let adapter = GmailAdapter::with_base_url(credentials, None, "http://127.0.0.1:1");
    let account = Account::new("owner", ProviderKind::Gmail, "a@b.com", "cred");

    let err = adapter.fetch_by_id(&account, "m-1").await.unwrap_err();
    assert!(err.is_retryable());
}

// ── Listing tests ───────────────────────────────────────────────────

#[tokio::test]
async fn listing_follows_pages_and_cursor() {
    let (state, adapter, account) = setup().await;
    for i in 0..45 {
        state.add_message(&format!("m-{i:02}"), "x@example.com", "s", "b");
    }

    let cursor = Cursor::Timestamp(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    let ids = adapter.fetch_ids_since(&account, Some(&cursor)).await.unwrap();
    assert_eq!(ids.len(), 45);

    let queries = state.list_queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 3);
    assert_eq!(queries[0].get("q").map(String::as_str), Some("after:1700000000"));
}

// ── Label tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn labels_are_created_listed_and_applied() {
    let (state, adapter, account) = setup().await;

    let created = adapter
        .create_label(
            &account,
            &LabelSpec {
                name: "Highly Relevant".into(),
                color: Some("#43d692".into()),
                hidden: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(created.color.as_deref(), Some("#43d692"));
    {
        let labels = state.labels.lock().unwrap();
        assert_eq!(labels[0]["labelListVisibility"], "labelHide");
    }

    let listed = adapter.list_labels(&account).await.unwrap();
    assert_eq!(listed, vec![created.clone()]);

    adapter
        .apply_labels(&account, "m-1", &[created.id.clone()])
        .await
        .unwrap();
    assert_eq!(
        state.modified.lock().unwrap().clone(),
        vec![("m-1".to_string(), vec![created.id])]
    );
    assert_eq!(state.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn system_label_names_are_renamed() {
    let (_state, adapter, _account) = setup().await;
    assert_eq!(adapter.remote_label_name("important"), "important_");
    assert_eq!(adapter.remote_label_name("spam"), "spam_");
    assert_eq!(adapter.remote_label_name("Work"), "Work");
}
