//! HTTP surface: Gmail push and Graph change-notification webhooks, admin
//! routes, health.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::PipelineError;
use crate::pipeline::dispatcher::{
    Dispatcher, decode_change_notifications, decode_push_envelope,
};

/// Shared state for all routes.
#[derive(Clone)]
pub struct WebhookState {
    pub dispatcher: Dispatcher,
    /// Admin routes answer 404 when unset.
    pub admin_token: Option<SecretString>,
    /// Expected `clientState` of Graph notifications; the route answers 404 when unset.
    pub graph_client_state: Option<SecretString>,
}

impl WebhookState {
    pub fn new(dispatcher: Dispatcher, admin_token: Option<SecretString>) -> Self {
        Self {
            dispatcher,
            admin_token,
            graph_client_state: None,
        }
    }

    pub fn with_graph_client_state(mut self, client_state: Option<SecretString>) -> Self {
        self.graph_client_state = client_state;
        self
    }
}

#[derive(Deserialize)]
struct ValidationQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

pub fn routes(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/gmail", post(gmail_push))
        .route("/webhook/microsoft", post(graph_notification))
        .route("/admin/accounts/{id}/synchronize", post(admin_synchronize))
        .route("/admin/accounts/{id}/watch", post(admin_watch).delete(admin_unwatch))
        .route("/admin/accounts/{id}/retry-failed", post(admin_retry_failed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Decode, resolve, hand off, ack. Only a malformed envelope is rejected.
async fn gmail_push(State(state): State<WebhookState>, body: Bytes) -> Response {
    let push = match decode_push_envelope(&body) {
        Ok(push) => push,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed push envelope");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    };

    match state.dispatcher.handle_push(push).await {
        Ok(ack) => Json(json!({ "status": ack.status() })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Graph subscription validation handshake, then change notifications.
///
/// Every notification must carry the configured `clientState`; a single
/// mismatch rejects the whole delivery.
async fn graph_notification(
    State(state): State<WebhookState>,
    Query(query): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = query.validation_token {
        return ([(header::CONTENT_TYPE, "text/plain")], token).into_response();
    }
    let Some(expected) = &state.graph_client_state else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let changes = match decode_change_notifications(&body) {
        Ok(changes) => changes,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed change notification");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    };
    if changes
        .iter()
        .any(|c| c.client_state.as_deref() != Some(expected.expose_secret()))
    {
        warn!("Rejecting change notification with unexpected clientState");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "clientState mismatch" })),
        )
            .into_response();
    }

    for change in changes {
        if let Err(e) = state.dispatcher.handle_change(change).await {
            return error_response(e);
        }
    }
    StatusCode::ACCEPTED.into_response()
}

async fn admin_watch(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.dispatcher.watch(&id).await {
        Ok(subscription) => Json(json!({
            "subscriptionId": subscription.as_ref().map(|s| s.id.clone()),
            "expiresAt": subscription.and_then(|s| s.expires_at).map(|t| t.to_rfc3339()),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn admin_unwatch(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.dispatcher.unwatch(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn admin_synchronize(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.dispatcher.synchronize(&id).await {
        Ok(report) => Json(json!({ "processedCount": report.processed_count })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn admin_retry_failed(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.dispatcher.retry_failed(&id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

fn authorize(state: &WebhookState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.admin_token else {
        return Err(StatusCode::NOT_FOUND.into_response());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if token == expected.expose_secret() => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid admin token" })),
        )
            .into_response()),
    }
}

fn error_response(e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Webhook(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}
