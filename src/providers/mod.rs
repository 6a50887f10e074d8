//! Mailbox provider adapters.
//!
//! Every provider variant implements one capability set
//! (`fetch_by_id`, `fetch_ids_since`, label operations, `send`, `watch`).
//! Provider quirks stay inside the adapter; callers only see `RawMessage`
//! and the `ProviderError` taxonomy.

pub mod gmail;
pub mod graph;
pub mod http;
pub mod imap;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::pipeline::types::RawMessage;
use crate::store::traits::Account;

pub use gmail::GmailAdapter;
pub use graph::GraphAdapter;
pub use imap::{ImapAdapter, ImapConfig};

// ── Provider kind & cursor ──────────────────────────────────────────

/// Closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Push-webhook mailbox API.
    Gmail,
    /// REST graph API.
    Graph,
    /// Generic IMAP/SMTP.
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Graph => "graph",
            Self::Imap => "imap",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(Self::Gmail),
            "graph" => Some(Self::Graph),
            "imap" => Some(Self::Imap),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resume marker for incremental fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Timestamp(DateTime<Utc>),
    Token(String),
}

impl Cursor {
    /// Encode for the `accounts.cursor` column.
    pub fn to_db(&self) -> String {
        match self {
            Self::Timestamp(ts) => format!("ts:{}", ts.to_rfc3339()),
            Self::Token(t) => format!("tok:{t}"),
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        if let Some(ts) = s.strip_prefix("ts:") {
            return DateTime::parse_from_rfc3339(ts)
                .ok()
                .map(|dt| Self::Timestamp(dt.with_timezone(&Utc)));
        }
        s.strip_prefix("tok:").map(|t| Self::Token(t.to_string()))
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Token(_) => None,
        }
    }
}

// ── Labels & outbound ───────────────────────────────────────────────

/// A label/category/keyword as it exists on the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLabel {
    /// Identifier used when applying the label (for some providers the name itself).
    pub id: String,
    pub name: String,
    pub color: Option<String>,
}

/// A label the replicator wants created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSpec {
    pub name: String,
    pub color: Option<String>,
    /// Hide from the provider's label list and message list where supported.
    pub hidden: bool,
}

/// An active push subscription on the provider side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSubscription {
    pub id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// An outbound mail.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

// ── Credentials ─────────────────────────────────────────────────────

/// Source of provider credentials (OAuth access tokens or IMAP passwords).
///
/// Token exchange lives outside this crate; adapters only ask for the
/// current secret and, after an `AuthExpired`, for a refreshed one.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn access_token(&self, account: &Account) -> Result<SecretString, ProviderError>;

    async fn refresh(&self, account: &Account) -> Result<SecretString, ProviderError>;
}

/// Fixed credentials keyed by credential reference (falls back to the address).
#[derive(Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, SecretString>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, secret: &str) -> Self {
        self.secrets
            .insert(key.to_string(), SecretString::from(secret.to_string()));
        self
    }

    /// Parse `key=secret,key2=secret2` from `MAIL_ASSIST_ACCESS_TOKENS`.
    pub fn from_env() -> Self {
        let raw = std::env::var("MAIL_ASSIST_ACCESS_TOKENS").unwrap_or_default();
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Self {
        raw.split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .fold(Self::new(), |creds, (k, v)| creds.with(k, v))
    }

    fn lookup(&self, account: &Account) -> Result<SecretString, ProviderError> {
        self.secrets
            .get(&account.credential_ref)
            .or_else(|| self.secrets.get(&account.address))
            .cloned()
            .ok_or_else(|| ProviderError::AuthExpired {
                provider: account.provider.to_string(),
                reason: format!("no credential for {}", account.address),
            })
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn access_token(&self, account: &Account) -> Result<SecretString, ProviderError> {
        self.lookup(account)
    }

    async fn refresh(&self, account: &Account) -> Result<SecretString, ProviderError> {
        self.lookup(account)
    }
}

/// Run a provider call; on `AuthExpired`, refresh once and retry once.
///
/// A second auth rejection is reported as `Transient`.
pub async fn with_auth_refresh<T, F, Fut>(
    credentials: &dyn CredentialSource,
    account: &Account,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match call().await {
        Err(ProviderError::AuthExpired { reason, .. }) => {
            tracing::info!(account = %account.address, reason = %reason, "Refreshing expired credentials");
            credentials.refresh(account).await?;
            call().await.map_err(ProviderError::into_transient)
        }
        other => other,
    }
}

// ── Adapter trait ───────────────────────────────────────────────────

/// Capability set implemented by each provider variant.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch one message. `NotFound` when the remote message is gone.
    async fn fetch_by_id(&self, account: &Account, id: &str) -> Result<RawMessage, ProviderError>;

    /// Remote ids received after the cursor (all recent ids when `None`).
    async fn fetch_ids_since(
        &self,
        account: &Account,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<String>, ProviderError>;

    async fn list_labels(&self, account: &Account) -> Result<Vec<RemoteLabel>, ProviderError>;

    async fn create_label(
        &self,
        account: &Account,
        spec: &LabelSpec,
    ) -> Result<RemoteLabel, ProviderError>;

    /// Apply resolved label ids to one message in a single call.
    async fn apply_labels(
        &self,
        account: &Account,
        id: &str,
        label_ids: &[String],
    ) -> Result<(), ProviderError>;

    /// Move a message into a named folder. Providers without folders ignore it.
    async fn move_to_folder(
        &self,
        _account: &Account,
        _id: &str,
        _folder: &str,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn send(&self, account: &Account, mail: &OutgoingMail) -> Result<(), ProviderError>;

    /// Start push notifications. Providers without push accept it as a no-op.
    ///
    /// Returns the subscription when the provider addresses its
    /// notifications by subscription id rather than by mailbox address.
    async fn watch(&self, _account: &Account) -> Result<Option<WatchSubscription>, ProviderError> {
        Ok(None)
    }

    async fn unwatch(&self, _account: &Account) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Colors available for new labels, in preference order.
    fn palette(&self) -> &'static [&'static str] {
        &[]
    }

    /// Fixed color for a taxonomy value, if the provider reserves one.
    fn reserved_color(&self, _name: &str) -> Option<&'static str> {
        None
    }

    /// Name actually used remotely (avoids collisions with system labels).
    fn remote_label_name(&self, name: &str) -> String {
        name.to_string()
    }

    /// Whether the replicator should also move messages into a topic folder.
    fn supports_folders(&self) -> bool {
        false
    }
}

/// One adapter per provider kind, resolved by the account's variant.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.adapters.keys().copied().collect()
    }
}
