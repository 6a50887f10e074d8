//! In-process Gmail API double shared by the integration tests.
//!
//! Serves the subset of `users/me/...` the adapter calls, backed by plain
//! in-memory state that tests inspect afterwards.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const ACCESS_TOKEN: &str = "token";
const PAGE_SIZE: usize = 20;

#[derive(Default)]
pub struct GmailState {
    pub messages: Mutex<BTreeMap<String, Value>>,
    pub labels: Mutex<Vec<Value>>,
    pub modified: Mutex<Vec<(String, Vec<String>)>>,
    pub fetches: AtomicU32,
    pub creates: AtomicU32,
    pub list_queries: Mutex<Vec<HashMap<String, String>>>,
}

impl GmailState {
    pub fn add_message(&self, id: &str, from: &str, subject: &str, text: &str) {
        self.messages
            .lock()
            .unwrap()
            .insert(id.to_string(), message_json(id, from, subject, text));
    }

    pub fn add_raw(&self, id: &str, message: Value) {
        self.messages.lock().unwrap().insert(id.to_string(), message);
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| l["name"].as_str().map(String::from))
            .collect()
    }
}

/// A `multipart/alternative` message with a plain and an HTML part.
pub fn message_json(id: &str, from: &str, subject: &str, text: &str) -> Value {
    json!({
        "id": id,
        "internalDate": "1700000000000",
        "payload": {
            "mimeType": "multipart/alternative",
            "headers": [
                { "name": "Subject", "value": subject },
                { "name": "From", "value": from },
                { "name": "Cc", "value": "Carol <carol@example.com>, dave@example.com" },
                { "name": "Date", "value": "Tue, 14 Nov 2023 22:13:20 +0000" }
            ],
            "parts": [
                { "mimeType": "text/plain", "body": { "data": URL_SAFE_NO_PAD.encode(text) } },
                {
                    "mimeType": "text/html",
                    "body": { "data": URL_SAFE_NO_PAD.encode(format!("<p>{text}</p>")) }
                }
            ]
        }
    })
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {ACCESS_TOKEN}"))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_token" }))).into_response()
}

async fn list_messages(
    State(state): State<Arc<GmailState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    state.list_queries.lock().unwrap().push(query.clone());

    let ids: Vec<String> = state.messages.lock().unwrap().keys().cloned().collect();
    let offset: usize = query
        .get("pageToken")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let page: Vec<Value> = ids
        .iter()
        .skip(offset)
        .take(PAGE_SIZE)
        .map(|id| json!({ "id": id, "threadId": id }))
        .collect();

    let mut body = json!({ "messages": page, "resultSizeEstimate": ids.len() });
    if offset + PAGE_SIZE < ids.len() {
        body["nextPageToken"] = json!((offset + PAGE_SIZE).to_string());
    }
    Json(body).into_response()
}

async fn get_message(
    State(state): State<Arc<GmailState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    state.fetches.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) || id == "revoked" {
        return unauthorized();
    }
    match state.messages.lock().unwrap().get(&id) {
        Some(message) => Json(message.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response(),
    }
}

async fn modify_message(
    State(state): State<Arc<GmailState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let ids = body["addLabelIds"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    state.modified.lock().unwrap().push((id.clone(), ids));
    Json(json!({ "id": id })).into_response()
}

async fn list_labels(State(state): State<Arc<GmailState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "labels": state.labels.lock().unwrap().clone() })).into_response()
}

async fn create_label(
    State(state): State<Arc<GmailState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let n = state.creates.fetch_add(1, Ordering::SeqCst) + 1;
    let mut label = body.clone();
    label["id"] = json!(format!("Label_{n}"));
    label["type"] = json!("user");
    state.labels.lock().unwrap().push(label.clone());
    Json(label).into_response()
}

/// Start the double on a random local port. Returns its base URL.
pub async fn start_gmail(state: Arc<GmailState>) -> String {
    let app = Router::new()
        .route("/users/me/messages", get(list_messages))
        .route("/users/me/messages/{id}", get(get_message))
        .route("/users/me/messages/{id}/modify", post(modify_message))
        .route("/users/me/labels", get(list_labels).post(create_label))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}
