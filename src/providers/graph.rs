//! Microsoft Graph adapter (REST graph API).
//!
//! Graph returns one rendered body per message, so the body tree is a single
//! leaf. Labels are "master categories" applied by display name, and a
//! classified message is also moved into a folder named after its topic.
//! Push notifications use change subscriptions on the inbox that expire
//! after a few days and are renewed by calling `watch` again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::error::ProviderError;
use crate::pipeline::types::{AttachmentMeta, BodyPart, Participant, RawMessage};
use crate::providers::http;
use crate::providers::{
    CredentialSource, Cursor, LabelSpec, OutgoingMail, ProviderAdapter, ProviderKind, RemoteLabel,
    WatchSubscription,
};
use crate::store::traits::Account;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const PROVIDER: &str = "graph";
const PAGE_SIZE: u32 = 100;
/// Longest lifetime Graph accepts for mail subscriptions.
const SUBSCRIPTION_MINUTES: i64 = 4230;
const SUBSCRIPTION_RESOURCE: &str = "me/mailFolders('inbox')/messages";

const CATEGORY_COLORS: &[(&str, &str)] = &[
    ("important", "Preset16"),
    ("informative", "Preset7"),
    ("useless", "Preset12"),
    ("Answer Required", "Preset9"),
];

const PALETTE: &[&str] = &[
    "Preset0", "Preset1", "Preset2", "Preset3", "Preset4", "Preset5", "Preset6", "Preset8",
    "Preset10", "Preset11", "Preset13", "Preset14", "Preset15", "Preset17", "Preset18",
    "Preset19", "Preset20", "Preset21", "Preset22", "Preset23", "Preset24",
];

/// Where Graph delivers change notifications, and the shared secret it echoes back.
#[derive(Clone)]
pub struct GraphNotifications {
    pub url: String,
    pub client_state: SecretString,
}

/// Graph mail adapter.
pub struct GraphAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    notifications: Option<GraphNotifications>,
}

impl GraphAdapter {
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self::with_base_url(credentials, GRAPH_API_BASE)
    }

    pub fn with_base_url(credentials: Arc<dyn CredentialSource>, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, notifications: Option<GraphNotifications>) -> Self {
        self.notifications = notifications;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/me/{}", self.base_url, path)
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/subscriptions", self.base_url)
    }

    async fn attachment_names(
        &self,
        account: &Account,
        id: &str,
    ) -> Result<Vec<AttachmentMeta>, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .get(self.url(&format!("messages/{id}/attachments")))
            .query(&[("$select", "id,name")]);
        let list: ValueList<GraphAttachment> = http::send_json(PROVIDER, id, request, &token).await?;
        Ok(list
            .value
            .into_iter()
            .map(|a| AttachmentMeta {
                provider_attachment_id: Some(a.id),
                filename: a.name.unwrap_or_default(),
            })
            .collect())
    }

    /// Find a mail folder by display name, creating it when missing.
    async fn ensure_folder(&self, account: &Account, name: &str) -> Result<String, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .get(self.url("mailFolders"))
            .query(&[("$top", "250")]);
        let folders: ValueList<GraphFolder> =
            http::send_json(PROVIDER, "mailFolders.list", request, &token).await?;
        if let Some(folder) = folders.value.into_iter().find(|f| f.display_name == name) {
            return Ok(folder.id);
        }

        let request = self
            .client
            .post(self.url("mailFolders"))
            .json(&json!({ "displayName": name }));
        let created: GraphFolder =
            http::send_json(PROVIDER, "mailFolders.create", request, &token).await?;
        tracing::info!(account = %account.address, folder = %name, "Created mail folder");
        Ok(created.id)
    }
}

#[async_trait]
impl ProviderAdapter for GraphAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Graph
    }

    async fn fetch_by_id(&self, account: &Account, id: &str) -> Result<RawMessage, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let request = self.client.get(self.url(&format!("messages/{id}")));
        let message: GraphMessage = http::send_json(PROVIDER, id, request, &token).await?;

        let attachments = if message.has_attachments {
            self.attachment_names(account, id).await?
        } else {
            Vec::new()
        };
        Ok(message.into_raw(attachments))
    }

    async fn fetch_ids_since(
        &self,
        account: &Account,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<String>, ProviderError> {
        let token = self.credentials.access_token(account).await?;

        let mut request = self
            .client
            .get(self.url("mailFolders/inbox/messages"))
            .query(&[("$select", "id"), ("$orderby", "receivedDateTime desc")])
            .query(&[("$top", PAGE_SIZE)]);
        if let Some(since) = cursor.and_then(Cursor::as_timestamp) {
            request = request.query(&[("$filter", received_filter(since))]);
        }

        let mut ids = Vec::new();
        loop {
            let page: ValueList<MessageRef> =
                http::send_json(PROVIDER, "messages.list", request, &token).await?;
            ids.extend(page.value.into_iter().map(|m| m.id));
            match page.next_link {
                // nextLink already carries every query parameter.
                Some(next) => request = self.client.get(next),
                None => break,
            }
        }
        Ok(ids)
    }

    async fn list_labels(&self, account: &Account) -> Result<Vec<RemoteLabel>, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let request = self.client.get(self.url("outlook/masterCategories"));
        let list: ValueList<GraphCategory> =
            http::send_json(PROVIDER, "masterCategories.list", request, &token).await?;
        Ok(list.value.into_iter().map(GraphCategory::into_remote).collect())
    }

    async fn create_label(
        &self,
        account: &Account,
        spec: &LabelSpec,
    ) -> Result<RemoteLabel, ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let mut body = json!({ "displayName": spec.name });
        if let Some(ref color) = spec.color {
            body["color"] = json!(color);
        }
        let request = self
            .client
            .post(self.url("outlook/masterCategories"))
            .json(&body);
        let created: GraphCategory =
            http::send_json(PROVIDER, "masterCategories.create", request, &token).await?;
        Ok(created.into_remote())
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
            .patch(self.url(&format!("messages/{id}")))
            .json(&json!({ "categories": label_ids }));
        http::send(PROVIDER, id, request, &token).await?;
        Ok(())
    }

    async fn move_to_folder(
        &self,
        account: &Account,
        id: &str,
        folder: &str,
    ) -> Result<(), ProviderError> {
        let folder_id = self.ensure_folder(account, folder).await?;
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .post(self.url(&format!("messages/{id}/move")))
            .json(&json!({ "destinationId": folder_id }));
        http::send(PROVIDER, id, request, &token).await?;
        Ok(())
    }

    async fn send(&self, account: &Account, mail: &OutgoingMail) -> Result<(), ProviderError> {
        let token = self.credentials.access_token(account).await?;
        let recipients: Vec<_> = mail
            .to
            .iter()
            .map(|address| json!({ "emailAddress": { "address": address } }))
            .collect();
        let request = self.client.post(self.url("sendMail")).json(&json!({
            "message": {
                "subject": mail.subject,
                "body": { "contentType": "Text", "content": mail.body },
                "toRecipients": recipients,
            },
            "saveToSentItems": true,
        }));
        http::send(PROVIDER, "sendMail", request, &token).await?;
        Ok(())
    }

    async fn watch(&self, account: &Account) -> Result<Option<WatchSubscription>, ProviderError> {
        let Some(ref notifications) = self.notifications else {
            return Err(ProviderError::Unsupported {
                provider: PROVIDER.to_string(),
                operation: "watch without MAIL_ASSIST_GRAPH_NOTIFICATION_URL".to_string(),
            });
        };
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .post(self.subscriptions_url())
            .json(&subscription_body(notifications, Utc::now()));
        let created: GraphSubscription =
            http::send_json(PROVIDER, "subscriptions.create", request, &token).await?;
        tracing::info!(
            account = %account.address,
            subscription = %created.id,
            "Graph change notifications enabled"
        );
        Ok(Some(WatchSubscription {
            id: created.id,
            expires_at: created
                .expiration_date_time
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }))
    }

    async fn unwatch(&self, account: &Account) -> Result<(), ProviderError> {
        let Some(ref id) = account.watch_id else {
            return Ok(());
        };
        let token = self.credentials.access_token(account).await?;
        let request = self
            .client
            .delete(format!("{}/{id}", self.subscriptions_url()));
        match http::send(PROVIDER, "subscriptions.delete", request, &token).await {
            Ok(_) | Err(ProviderError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn palette(&self) -> &'static [&'static str] {
        PALETTE
    }

    fn reserved_color(&self, name: &str) -> Option<&'static str> {
        CATEGORY_COLORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }

    fn supports_folders(&self) -> bool {
        true
    }
}

fn received_filter(since: DateTime<Utc>) -> String {
    format!(
        "receivedDateTime ge {}",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Subscription request for new and deleted inbox messages.
fn subscription_body(notifications: &GraphNotifications, now: DateTime<Utc>) -> serde_json::Value {
    let expires = now + Duration::minutes(SUBSCRIPTION_MINUTES);
    json!({
        "changeType": "created,deleted",
        "notificationUrl": notifications.url,
        "resource": SUBSCRIPTION_RESOURCE,
        "expirationDateTime": expires.to_rfc3339_opts(SecondsFormat::Secs, true),
        "clientState": notifications.client_state.expose_secret(),
    })
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSubscription {
    id: String,
    expiration_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphAttachment {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCategory {
    display_name: String,
    color: Option<String>,
}

impl GraphCategory {
    /// Graph applies categories by display name, so the name is the id.
    fn into_remote(self) -> RemoteLabel {
        RemoteLabel {
            id: self.display_name.clone(),
            name: self.display_name,
            color: self.color,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    bcc_recipients: Vec<GraphRecipient>,
    sent_date_time: Option<DateTime<Utc>>,
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    has_attachments: bool,
    body: Option<GraphBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphAddress,
}

#[derive(Debug, Deserialize)]
struct GraphAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: String,
    #[serde(default)]
    content: String,
}

impl GraphRecipient {
    fn into_participant(self) -> Option<Participant> {
        let address = self.email_address.address?;
        Some(Participant::new(self.email_address.name.as_deref(), &address))
    }
}

impl GraphMessage {
    pub(crate) fn into_raw(self, attachments: Vec<AttachmentMeta>) -> RawMessage {
        let subject = self.subject.unwrap_or_default();
        let is_reply = subject.trim_start().to_lowercase().starts_with("re:");

        let body = match self.body {
            Some(b) if b.content_type.eq_ignore_ascii_case("html") => BodyPart::Html(b.content),
            Some(b) => BodyPart::Plain(b.content),
            None => BodyPart::Plain(String::new()),
        };

        RawMessage {
            provider_message_id: self.id,
            sender: self
                .from
                .and_then(GraphRecipient::into_participant)
                .unwrap_or_else(|| Participant::new(None, "unknown")),
            cc: self
                .cc_recipients
                .into_iter()
                .filter_map(GraphRecipient::into_participant)
                .collect(),
            bcc: self
                .bcc_recipients
                .into_iter()
                .filter_map(GraphRecipient::into_participant)
                .collect(),
            sent_at: self
                .sent_date_time
                .or(self.received_date_time)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            subject,
            is_reply,
            body,
            attachments,
        }
    }
}
