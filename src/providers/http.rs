//! Shared HTTP plumbing for the REST adapters.

use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use crate::error::ProviderError;

/// Map an HTTP status onto the provider error taxonomy.
pub fn status_error(provider: &str, status: StatusCode, context: &str, body: &str) -> ProviderError {
    let reason = format!("{context}: HTTP {status}: {}", truncate(body, 300));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthExpired {
            provider: provider.to_string(),
            reason,
        },
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::NotFound {
            provider: provider.to_string(),
            id: context.to_string(),
        },
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            ProviderError::Transient {
                provider: provider.to_string(),
                reason,
            }
        }
        _ => ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        },
    }
}

/// Network-level failures are always transient.
pub fn transport_error(provider: &str, context: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        provider: provider.to_string(),
        reason: format!("{context}: {err}"),
    }
}

/// Attach the bearer token, send, and map non-2xx statuses.
pub async fn send(
    provider: &str,
    context: &str,
    request: RequestBuilder,
    token: &SecretString,
) -> Result<Response, ProviderError> {
    let response = request
        .bearer_auth(token.expose_secret())
        .send()
        .await
        .map_err(|e| transport_error(provider, context, e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(provider, status, context, &body))
}

/// Like [`send`], then decode a JSON body.
pub async fn send_json<T: DeserializeOwned>(
    provider: &str,
    context: &str,
    request: RequestBuilder,
    token: &SecretString,
) -> Result<T, ProviderError> {
    let response = send(provider, context, request, token).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("{context}: undecodable body: {e}"),
        })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
