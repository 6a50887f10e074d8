//! `Database` trait: single async interface for all persistence.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::llm::TokenUsage;
use crate::pipeline::types::{Classification, NormalizedMessage, Participant};
use crate::providers::{Cursor, ProviderKind, WatchSubscription};

/// A linked mailbox.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    /// Tenant that owns the mailbox; usage totals and contacts are per owner.
    pub owner_id: String,
    pub provider: ProviderKind,
    pub address: String,
    pub credential_ref: String,
    /// Server host override (IMAP accounts).
    pub server: Option<String>,
    /// Classifier key; `None` uses the registry default.
    pub ai_backend: Option<String>,
    pub cursor: Option<Cursor>,
    /// Provider push subscription id (Graph subscriptions).
    pub watch_id: Option<String>,
    pub watch_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(owner_id: &str, provider: ProviderKind, address: &str, credential_ref: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            provider,
            address: address.to_string(),
            credential_ref: credential_ref.to_string(),
            server: None,
            ai_backend: None,
            cursor: None,
            watch_id: None,
            watch_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Processing state of a record. Only ever advances out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Classified,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Classified => "CLASSIFIED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "CLASSIFIED" => Self::Classified,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// The persisted representation of one remote message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub account_id: String,
    pub provider_message_id: String,
    pub subject: String,
    pub body: String,
    pub sender: Participant,
    pub sent_at: DateTime<Utc>,
    pub is_reply: bool,
    pub has_attachments: bool,
    /// Set once the record is `Classified`.
    pub classification: Option<Classification>,
    pub state: RecordState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to the idempotent insert.
#[derive(Debug, Clone, Copy)]
pub struct NewRecord<'a> {
    pub account: &'a Account,
    pub message: &'a NormalizedMessage,
    /// Upsert the sender into the owner's contacts in the same transaction.
    pub save_contact: bool,
}

/// Result of `insert_record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted {
        record_id: String,
    },
    /// A record for `(account, provider_message_id)` already exists; nothing was written.
    AlreadyExists {
        record_id: String,
        state: RecordState,
        updated_at: DateTime<Utc>,
    },
}

/// Cached mapping of a taxonomy value to the provider's label id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLabel {
    pub name: String,
    pub remote_id: String,
    pub color: Option<String>,
}

/// Running token/cost totals for one owner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
    pub calls: u64,
}

/// One AI call, appended to `llm_calls`.
pub struct LlmCallRecord<'a> {
    pub owner_id: &'a str,
    pub record_id: Option<&'a str>,
    pub provider: &'a str,
    pub model: &'a str,
    pub usage: TokenUsage,
    pub cost: Decimal,
    pub success: bool,
}

/// A saved sender of an owner's mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub address: String,
    pub name: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &Account) -> Result<(), DatabaseError>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>, DatabaseError>;

    async fn get_account_by_address(&self, address: &str)
    -> Result<Option<Account>, DatabaseError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Resolve an account from the push subscription id a provider sends back.
    async fn get_account_by_watch_id(
        &self,
        watch_id: &str,
    ) -> Result<Option<Account>, DatabaseError>;

    /// Store (or clear, with `None`) the account's push subscription.
    async fn set_watch(
        &self,
        account_id: &str,
        watch: Option<&WatchSubscription>,
    ) -> Result<(), DatabaseError>;

    /// Store a new fetch cursor. A timestamp cursor never moves backward;
    /// returns whether the stored cursor changed.
    async fn update_cursor(&self, account_id: &str, cursor: &Cursor)
    -> Result<bool, DatabaseError>;

    // ── Categories & sender rules ───────────────────────────────────

    async fn add_category(
        &self,
        account_id: &str,
        name: &str,
        description: &str,
    ) -> Result<(), DatabaseError>;

    /// `(name, description)` pairs, ordered by name.
    async fn list_categories(&self, account_id: &str)
    -> Result<Vec<(String, String)>, DatabaseError>;

    async fn add_sender_rule(&self, account_id: &str, pattern: &str) -> Result<(), DatabaseError>;

    /// Blocking patterns (`user@host`, `@host` or `host`).
    async fn list_sender_rules(&self, account_id: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Message records ─────────────────────────────────────────────

    /// Insert a `PENDING` record plus participants, attachments and contact
    /// in one transaction. An existing record (including one that wins a
    /// concurrent race) yields `AlreadyExists`, never an error.
    async fn insert_record(&self, new: NewRecord<'_>) -> Result<InsertOutcome, DatabaseError>;

    async fn get_record(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    async fn get_record_by_provider_id(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>, DatabaseError>;

    /// Provider ids considered persisted: every record except `PENDING`
    /// ones last touched before `stale_before`.
    async fn persisted_ids(
        &self,
        account_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<HashSet<String>, DatabaseError>;

    /// Provider ids of the account's records still in `PENDING`.
    async fn pending_ids(&self, account_id: &str) -> Result<HashSet<String>, DatabaseError>;

    /// Take over a stale `PENDING` record. Returns false when another
    /// worker touched it after `stale_before` or it is no longer pending.
    async fn claim_stale_record(
        &self,
        record_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `PENDING`/`FAILED` → `CLASSIFIED`. Returns false if the record was already classified.
    ///
    /// `FAILED` → `CLASSIFIED` is reserved for the operator retry; the pipeline
    /// itself only classifies `PENDING` records.
    async fn mark_classified(
        &self,
        record_id: &str,
        classification: &Classification,
        attempts: u32,
    ) -> Result<bool, DatabaseError>;

    /// `PENDING` → `FAILED`. Returns false if the record had left `PENDING`.
    async fn mark_failed(
        &self,
        record_id: &str,
        attempts: u32,
        last_error: &str,
    ) -> Result<bool, DatabaseError>;

    /// Bump the attempt counter of a `FAILED` record after another failed retry.
    async fn record_failed_retry(
        &self,
        record_id: &str,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), DatabaseError>;

    async fn failed_records(&self, account_id: &str) -> Result<Vec<MessageRecord>, DatabaseError>;

    async fn count_records(&self, account_id: &str) -> Result<usize, DatabaseError>;

    /// Remove a record and its related rows after the remote message was
    /// deleted. Returns whether a record existed.
    async fn delete_record(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// `(role, participant)` rows of a record; role is `from`, `cc` or `bcc`.
    async fn list_participants(
        &self,
        record_id: &str,
    ) -> Result<Vec<(String, Participant)>, DatabaseError>;

    async fn list_contacts(&self, owner_id: &str) -> Result<Vec<Contact>, DatabaseError>;

    // ── Label cache ─────────────────────────────────────────────────

    async fn get_cached_labels(&self, account_id: &str) -> Result<Vec<CachedLabel>, DatabaseError>;

    async fn put_cached_label(
        &self,
        account_id: &str,
        label: &CachedLabel,
    ) -> Result<(), DatabaseError>;

    /// Drop every cached label id of an account.
    async fn clear_cached_labels(&self, account_id: &str) -> Result<(), DatabaseError>;

    // ── Usage accounting ────────────────────────────────────────────

    /// Add (never overwrite) token counts and cost to the owner's totals.
    async fn add_usage(
        &self,
        owner_id: &str,
        usage: &TokenUsage,
        cost: Decimal,
    ) -> Result<(), DatabaseError>;

    async fn get_usage(&self, owner_id: &str) -> Result<UsageTotals, DatabaseError>;

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError>;

    /// Increment distribution counters for each classified dimension.
    async fn bump_classification_stats(
        &self,
        owner_id: &str,
        classification: &Classification,
    ) -> Result<(), DatabaseError>;

    /// `(dimension, value, count)` rows for an owner.
    async fn classification_stats(
        &self,
        owner_id: &str,
    ) -> Result<Vec<(String, String, u64)>, DatabaseError>;
}
