//! Gmail REST adapter (push-webhook mailbox API).
//!
//! Quirks absorbed here:
//! - body data arrives in URL-safe base64, with or without padding
//! - `In-Reply-To` marks replies; parts with a filename are attachments
//! - `important`/`spam` collide with system labels and get a `_` suffix
//! - a timestamp cursor lists with `after:<epoch>`, a token cursor walks history

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::pipeline::types::{AttachmentMeta, BodyPart, Participant, RawMessage};
use crate::providers::http;
use crate::providers::{
    CredentialSource, Cursor, LabelSpec, OutgoingMail, ProviderAdapter, ProviderKind, RemoteLabel,
    WatchSubscription,
};
use crate::store::traits::Account;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

const PROVIDER: &str = "gmail";
const LIST_PAGE_SIZE: u32 = 500;
const LABEL_TEXT_COLOR: &str = "#000000";

/// Fixed colors for taxonomy values.
const LABEL_COLORS: &[(&str, &str)] = &[
    ("important", "#fb4c2f"),
    ("informative", "#4a86e8"),
    ("useless", "#999999"),
    ("spam", "#cc3a21"),
    ("scam", "#994a64"),
    ("newsletter", "#16a766"),
    ("notification", "#fad165"),
    ("meeting", "#6d9eeb"),
    ("Answer Required", "#ffc8af"),
    ("Might Require Answer", "#ffad46"),
    ("No Answer Required", "#98d7e4"),
    ("Highly Relevant", "#43d692"),
    ("Possibly Relevant", "#a2dcc1"),
    ("Not Relevant", "#cccccc"),
];

/// Background colors accepted by the Gmail label API.
const PALETTE: &[&str] = &[
    "#fb4c2f", "#ffad47", "#fad165", "#16a766", "#43d692", "#4a86e8", "#a479e2", "#f691b3",
    "#f6c5be", "#ffe6c7", "#fef1d1", "#b9e4d0", "#c6f3de", "#c9daf8", "#e4d7f5", "#fcdee8",
    "#efa093", "#ffd6a2", "#fce8b3", "#89d3b2", "#a0eac9", "#a4c2f4", "#d0bcf1", "#fbc8d9",
    "#e66550", "#ffbc6b", "#fcda83", "#44b984", "#68dfa9", "#6d9eeb", "#b694e8", "#f7a7c0",
];

/// Names that clash with Gmail system labels.
const RESERVED_NAMES: &[(&str, &str)] = &[("important", "important_"), ("spam", "spam_")];

/// Gmail adapter.
pub struct GmailAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    /// Pub/Sub topic for `watch()`.
    topic: Option<String>,
}

impl GmailAdapter {
    pub fn new(credentials: Arc<dyn CredentialSource>, topic: Option<String>) -> Self {
        Self::with_base_url(credentials, topic, GMAIL_API_BASE)
    }

    pub fn with_base_url(
        credentials: Arc<dyn CredentialSource>,
        topic: Option<String>,
        base_url: &str,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            topic,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.base_url, path)
    }

    async fn list_after(
        &self,
        account: &Account,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let query = after
            .map(|ts| format!("after:{}", ts.timestamp()))
            .unwrap_or_default();

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.url("messages"))
                .query(&[("q", query.as_str())])
                .query(&[("maxResults", LIST_PAGE_SIZE)]);
            if let Some(ref pt) = page_token {
                request = request.query(&[("pageToken", pt.as_str())]);
            }

            let page: ListResponse = http::send_json(PROVIDER, "messages.list", request, &token).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    async fn list_history(
        &self,
        account: &Account,
        start_history_id: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let token = self.credentials.access_token(account).await?;

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.url("history"))
                .query(&[
                    ("startHistoryId", start_history_id),
                    ("historyTypes", "messageAdded"),
                ]);
            if let Some(ref pt) = page_token {
                request = request.query(&[("pageToken", pt.as_str())]);
            }

            let page: HistoryResponse = http::send_json(PROVIDER, "history.list", request, &token).await?;
            for entry in page.history {
                for added in entry.messages_added {
                    if !ids.contains(&added.message.id) {
                        ids.push(added.message.id);
                    }
                }
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn fetch_by_id(&self, account: &Account, id: &str) -> Result<RawMessage, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .get(self.url(&format!("messages/{id}")))
            .query(&[("format", "full")]);
        let message: GmailMessage = http::send_json(PROVIDER, id, request, &token).await?;
        debug!(id = %id, "Fetched Gmail message");
        message.into_raw()
    }

    async fn fetch_ids_since(
        &self,
        account: &Account,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<String>, ProviderError> {
        match cursor {
            Some(Cursor::Token(history_id)) => self.list_history(account, history_id).await,
            Some(Cursor::Timestamp(ts)) => self.list_after(account, Some(*ts)).await,
            None => self.list_after(account, None).await,
        }
    }

    async fn list_labels(&self, account: &Account) -> Result<Vec<RemoteLabel>, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let list: LabelList =
            http::send_json(PROVIDER, "labels.list", self.client.get(self.url("labels")), &token)
                .await?;
        Ok(list.labels.into_iter().map(GmailLabel::into_remote).collect())
    }

    async fn create_label(
        &self,
        account: &Account,
        spec: &LabelSpec,
    ) -> Result<RemoteLabel, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let (label_vis, message_vis) = if spec.hidden {
            ("labelHide", "hide")
        } else {
            ("labelShow", "show")
        };

        let mut body = json!({
            "name": spec.name,
            "labelListVisibility": label_vis,
            "messageListVisibility": message_vis,
        });
        if let Some(ref color) = spec.color {
            body["color"] = json!({
                "backgroundColor": color,
                "textColor": LABEL_TEXT_COLOR,
            });
        }

        let request = self.client.post(self.url("labels")).json(&body);
        let label: GmailLabel = http::send_json(PROVIDER, "labels.create", request, &token).await?;
        Ok(label.into_remote())
    }

    async fn apply_labels(
        &self,
        account: &Account,
        id: &str,
        label_ids: &[String],
    ) -> Result<(), ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .post(self.url(&format!("messages/{id}/modify")))
            .json(&json!({ "addLabelIds": label_ids }));
        http::send(PROVIDER, id, request, &token).await?;
        Ok(())
    }

    async fn send(&self, account: &Account, mail: &OutgoingMail) -> Result<(), ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let raw = build_rfc822(&account.address, mail)?;
        let request = self
            .client
            .post(self.url("messages/send"))
            .json(&json!({ "raw": URL_SAFE_NO_PAD.encode(raw) }));
        http::send(PROVIDER, "messages.send", request, &token).await?;
        Ok(())
    }

    async fn watch(&self, account: &Account) -> Result<Option<WatchSubscription>, ProviderError> {
        let Some(ref topic) = self.topic else {
            return Err(ProviderError::Unsupported {
                provider: PROVIDER.to_string(),
                operation: "watch without MAIL_ASSIST_GMAIL_TOPIC".to_string(),
            });
        };
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .post(self.url("watch"))
            .json(&json!({ "labelIds": ["INBOX"], "topicName": topic }));
        http::send(PROVIDER, "watch", request, &token).await?;
        tracing::info!(account = %account.address, "Gmail push notifications enabled");
        Ok(None)
    }

    async fn unwatch(&self, account: &Account) -> Result<(), ProviderError> {
        let token = self.credentials.access_token(account).await?;
        http::send(PROVIDER, "stop", self.client.post(self.url("stop")), &token).await?;
        Ok(())
    }

    fn palette(&self) -> &'static [&'static str] {
        PALETTE
    }

    fn reserved_color(&self, name: &str) -> Option<&'static str> {
        LABEL_COLORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }

    fn remote_label_name(&self, name: &str) -> String {
        RESERVED_NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, renamed)| renamed.to_string())
            .unwrap_or_else(|| name.to_string())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: String,
    color: Option<GmailLabelColor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabelColor {
    background_color: Option<String>,
}

impl GmailLabel {
    fn into_remote(self) -> RemoteLabel {
        RemoteLabel {
            id: self.id,
            name: self.name,
            color: self.color.and_then(|c| c.background_color),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GmailMessage {
    id: String,
    internal_date: Option<String>,
    payload: Option<GmailPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    data: Option<String>,
    attachment_id: Option<String>,
}

impl GmailMessage {
    pub(crate) fn into_raw(self) -> Result<RawMessage, ProviderError> {
        let payload = self.payload.ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("message {} has no payload", self.id),
        })?;

        let header = |name: &str| -> Option<&str> {
            payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        };

        let subject = header("Subject").unwrap_or_default().to_string();
        let sender = header("From").map(Participant::parse).unwrap_or_else(|| {
            Participant::new(None, "unknown")
        });
        let cc = header("Cc").map(Participant::parse_list).unwrap_or_default();
        let bcc = header("Bcc").map(Participant::parse_list).unwrap_or_default();
        let is_reply = header("In-Reply-To").is_some();

        let sent_at = header("Date")
            .and_then(parse_header_date)
            .or_else(|| {
                self.internal_date
                    .as_deref()
                    .and_then(|ms| ms.parse::<i64>().ok())
                    .and_then(DateTime::from_timestamp_millis)
            })
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let mut attachments = Vec::new();
        let body = part_to_body(&payload, &mut attachments);

        Ok(RawMessage {
            provider_message_id: self.id,
            subject,
            sender,
            cc,
            bcc,
            body,
            sent_at,
            is_reply,
            attachments,
        })
    }
}

fn part_to_body(part: &GmailPart, attachments: &mut Vec<AttachmentMeta>) -> BodyPart {
    if !part.filename.is_empty() {
        attachments.push(AttachmentMeta {
            provider_attachment_id: part.body.as_ref().and_then(|b| b.attachment_id.clone()),
            filename: part.filename.clone(),
        });
        return BodyPart::Other {
            mime_type: part.mime_type.clone(),
        };
    }

    let data = || {
        part.body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .map(decode_body_data)
            .unwrap_or_default()
    };

    let mime = part.mime_type.to_ascii_lowercase();
    if let Some(subtype) = mime.strip_prefix("multipart/") {
        BodyPart::Multipart {
            subtype: subtype.to_string(),
            children: part
                .parts
                .iter()
                .map(|p| part_to_body(p, attachments))
                .collect(),
        }
    } else if mime == "text/plain" {
        BodyPart::Plain(data())
    } else if mime == "text/html" {
        BodyPart::Html(data())
    } else if !part.parts.is_empty() {
        BodyPart::Multipart {
            subtype: "mixed".to_string(),
            children: part
                .parts
                .iter()
                .map(|p| part_to_body(p, attachments))
                .collect(),
        }
    } else {
        BodyPart::Other {
            mime_type: part.mime_type.clone(),
        }
    }
}

/// Decode Gmail body data (URL-safe alphabet, padding optional).
///
/// Standard-alphabet input is tolerated as well.
pub fn decode_body_data(data: &str) -> String {
    let normalized: String = data
        .trim()
        .trim_end_matches('=')
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    match URL_SAFE_NO_PAD.decode(normalized.as_bytes()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable Gmail body part");
            String::new()
        }
    }
}

/// Parse an RFC 2822 `Date` header, ignoring trailing comments like `(UTC)`.
fn parse_header_date(value: &str) -> Option<DateTime<Utc>> {
    let cleaned = match value.find('(') {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    };
    DateTime::parse_from_rfc2822(cleaned)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render an outbound mail as RFC 822 bytes.
pub(crate) fn build_rfc822(from: &str, mail: &OutgoingMail) -> Result<Vec<u8>, ProviderError> {
    let invalid = |reason: String| ProviderError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason,
    };

    let mut builder = lettre::Message::builder()
        .from(from.parse().map_err(|e| invalid(format!("bad from address: {e}")))?)
        .subject(mail.subject.clone());
    for to in &mail.to {
        builder = builder.to(to.parse().map_err(|e| invalid(format!("bad recipient {to}: {e}")))?);
    }
    let message = builder
        .body(mail.body.clone())
        .map_err(|e| invalid(format!("failed to build message: {e}")))?;
    Ok(message.formatted())
}
