//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes go through one
//! connection and are serialized by `write_lock`, so an explicit
//! `BEGIN … COMMIT` block never interleaves with another task's statements.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::llm::TokenUsage;
use crate::pipeline::types::{
    AnswerRequirement, Classification, Flags, Importance, Participant, Relevance,
};
use crate::providers::{Cursor, ProviderKind, WatchSubscription};
use crate::store::migrations;
use crate::store::traits::{
    Account, CachedLabel, Contact, Database, InsertOutcome, LlmCallRecord, MessageRecord,
    NewRecord, RecordState, UsageTotals,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn existing_outcome(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<InsertOutcome>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, state, updated_at FROM message_records
                 WHERE account_id = ?1 AND provider_message_id = ?2",
                params![account_id, provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("existing_outcome: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record_id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                let state: String = row.get(1).unwrap_or_default();
                let updated: String = row.get(2).unwrap_or_default();
                Ok(Some(InsertOutcome::AlreadyExists {
                    record_id,
                    state: RecordState::from_db(&state),
                    updated_at: parse_datetime(&updated),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("existing_outcome: {e}"))),
        }
    }

    /// Statements of the record insert transaction.
    async fn write_record_rows(
        &self,
        record_id: &str,
        new: &NewRecord<'_>,
    ) -> Result<(), libsql::Error> {
        let conn = self.conn();
        let msg = new.message;
        let now = ts(Utc::now());

        conn.execute(
            "INSERT INTO message_records (id, account_id, provider_message_id, subject, body,
                sender_name, sender_address, sent_at, is_reply, has_attachments,
                state, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'PENDING', 0, ?11, ?11)",
            params![
                record_id,
                new.account.id.as_str(),
                msg.provider_message_id.as_str(),
                msg.subject.as_str(),
                msg.body.as_str(),
                opt_text(msg.sender.name.as_deref()),
                msg.sender.address.as_str(),
                ts(msg.sent_at),
                i64::from(msg.is_reply),
                i64::from(msg.has_attachments),
                now.as_str(),
            ],
        )
        .await?;

        let roles = std::iter::once(("from", &msg.sender))
            .chain(msg.cc.iter().map(|p| ("cc", p)))
            .chain(msg.bcc.iter().map(|p| ("bcc", p)));
        for (role, participant) in roles {
            conn.execute(
                "INSERT INTO participants (record_id, role, name, address) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record_id,
                    role,
                    opt_text(participant.name.as_deref()),
                    participant.address.as_str(),
                ],
            )
            .await?;
        }

        for attachment in &msg.attachments {
            conn.execute(
                "INSERT INTO attachments (record_id, provider_attachment_id, filename) VALUES (?1, ?2, ?3)",
                params![
                    record_id,
                    opt_text(attachment.provider_attachment_id.as_deref()),
                    attachment.filename.as_str(),
                ],
            )
            .await?;
        }

        if new.save_contact {
            conn.execute(
                "INSERT INTO contacts (owner_id, address, name, last_seen) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner_id, address) DO UPDATE SET
                    name = COALESCE(excluded.name, contacts.name),
                    last_seen = excluded.last_seen",
                params![
                    new.account.owner_id.as_str(),
                    msg.sender.address.to_lowercase(),
                    opt_text(msg.sender.name.as_deref()),
                    now.as_str(),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn query_records(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = next_row(&mut rows, context).await? {
            match row_to_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping record row: {e}"),
            }
        }
        Ok(records)
    }

    async fn query_accounts(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut accounts = Vec::new();
        while let Some(row) = next_row(&mut rows, context).await? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so string comparison in SQL follows time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Next row of a result stream; a stream error is a query error, never an early end.
async fn next_row(
    rows: &mut libsql::Rows,
    context: &str,
) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

fn encode_flags(flags: &Flags) -> String {
    flags.active().join(",")
}

fn decode_flags(s: &str) -> Flags {
    let names: HashSet<&str> = s.split(',').map(str::trim).collect();
    Flags {
        spam: names.contains("spam"),
        scam: names.contains("scam"),
        newsletter: names.contains("newsletter"),
        notification: names.contains("notification"),
        meeting: names.contains("meeting"),
    }
}

fn parse_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

const ACCOUNT_COLUMNS: &str = "id, owner_id, provider, address, credential_ref, server, ai_backend, cursor, created_at, updated_at, watch_id, watch_expires_at";

const RECORD_COLUMNS: &str = "id, account_id, provider_message_id, subject, body, sender_name, sender_address, sent_at, is_reply, has_attachments, topic, importance, answer, relevance, flags, summary_one_line, summary_short, state, attempts, last_error, created_at, updated_at";

fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("account row parse: {e}"));
    let provider_str: String = row.get(2).map_err(parse)?;
    let provider = ProviderKind::from_db(&provider_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown provider '{provider_str}'"))
    })?;
    let cursor_str: Option<String> = row.get(7).ok();
    let created_str: String = row.get(8).map_err(parse)?;
    let updated_str: String = row.get(9).map_err(parse)?;
    let watch_expires: Option<String> = row.get(11).ok();

    Ok(Account {
        id: row.get(0).map_err(parse)?,
        owner_id: row.get(1).map_err(parse)?,
        provider,
        address: row.get(3).map_err(parse)?,
        credential_ref: row.get(4).map_err(parse)?,
        server: row.get(5).ok(),
        ai_backend: row.get(6).ok(),
        cursor: cursor_str.as_deref().and_then(Cursor::from_db),
        watch_id: row.get(10).ok(),
        watch_expires_at: watch_expires.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Rebuild the classification columns; `None` unless every field parses.
fn classification_from_row(row: &libsql::Row) -> Option<Classification> {
    let topic: String = row.get(10).ok()?;
    let importance: String = row.get(11).ok()?;
    let answer: String = row.get(12).ok()?;
    let relevance: String = row.get(13).ok()?;
    let flags: String = row.get(14).unwrap_or_default();
    Some(Classification {
        topic,
        importance: Importance::parse(&importance)?,
        answer: AnswerRequirement::parse(&answer)?,
        relevance: Relevance::parse(&relevance)?,
        flags: decode_flags(&flags),
        summary_one_line: row.get(15).unwrap_or_default(),
        summary_short: row.get(16).unwrap_or_default(),
    })
}

fn row_to_record(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let sender_name: Option<String> = row.get(5).ok();
    let sender_address: String = row.get(6)?;
    let sent_str: String = row.get(7)?;
    let state_str: String = row.get(17)?;
    let created_str: String = row.get(20)?;
    let updated_str: String = row.get(21)?;

    Ok(MessageRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_message_id: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        sender: Participant::new(sender_name.as_deref(), &sender_address),
        sent_at: parse_datetime(&sent_str),
        is_reply: row.get::<i64>(8).unwrap_or(0) != 0,
        has_attachments: row.get::<i64>(9).unwrap_or(0) != 0,
        classification: classification_from_row(row),
        state: RecordState::from_db(&state_str),
        attempts: u32::try_from(row.get::<i64>(18).unwrap_or(0)).unwrap_or(0),
        last_error: row.get(19).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &Account) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    account.id.as_str(),
                    account.owner_id.as_str(),
                    account.provider.as_str(),
                    account.address.as_str(),
                    account.credential_ref.as_str(),
                    opt_text(account.server.as_deref()),
                    opt_text(account.ai_backend.as_deref()),
                    opt_text(account.cursor.as_ref().map(Cursor::to_db).as_deref()),
                    ts(account.created_at),
                    ts(account.updated_at),
                    opt_text(account.watch_id.as_deref()),
                    opt_text(account.watch_expires_at.map(ts).as_deref()),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!("account {} already linked", account.address))
                } else {
                    DatabaseError::Query(format!("insert_account: {e}"))
                }
            })?;

        debug!(account = %account.id, address = %account.address, "Account inserted");
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>, DatabaseError> {
        let accounts = self
            .query_accounts(
                "get_account",
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(accounts.into_iter().next())
    }

    async fn get_account_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        let accounts = self
            .query_accounts(
                "get_account_by_address",
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE lower(address) = lower(?1)"
                ),
                params![address],
            )
            .await?;
        Ok(accounts.into_iter().next())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        self.query_accounts(
            "list_accounts",
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at ASC"),
            (),
        )
        .await
    }

    async fn get_account_by_watch_id(
        &self,
        watch_id: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        let accounts = self
            .query_accounts(
                "get_account_by_watch_id",
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE watch_id = ?1"),
                params![watch_id],
            )
            .await?;
        Ok(accounts.into_iter().next())
    }

    async fn set_watch(
        &self,
        account_id: &str,
        watch: Option<&WatchSubscription>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE accounts SET watch_id = ?1, watch_expires_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    opt_text(watch.map(|w| w.id.as_str())),
                    opt_text(watch.and_then(|w| w.expires_at).map(ts).as_deref()),
                    ts(Utc::now()),
                    account_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_watch: {e}")))?;
        Ok(())
    }

    async fn update_cursor(
        &self,
        account_id: &str,
        cursor: &Cursor,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .get_account(account_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "account".to_string(),
                id: account_id.to_string(),
            })?
            .cursor;

        if let (Some(Cursor::Timestamp(old)), Cursor::Timestamp(new)) = (&current, cursor)
            && new <= old
        {
            return Ok(false);
        }
        if current.as_ref() == Some(cursor) {
            return Ok(false);
        }

        self.conn()
            .execute(
                "UPDATE accounts SET cursor = ?1, updated_at = ?2 WHERE id = ?3",
                params![cursor.to_db(), ts(Utc::now()), account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_cursor: {e}")))?;
        debug!(account = %account_id, cursor = %cursor.to_db(), "Cursor advanced");
        Ok(true)
    }

    // ── Categories & sender rules ───────────────────────────────────

    async fn add_category(
        &self,
        account_id: &str,
        name: &str,
        description: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO categories (account_id, name, description) VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id, name) DO UPDATE SET description = excluded.description",
                params![account_id, name, description],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_category: {e}")))?;
        Ok(())
    }

    async fn list_categories(
        &self,
        account_id: &str,
    ) -> Result<Vec<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, description FROM categories WHERE account_id = ?1 ORDER BY name",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_categories: {e}")))?;

        let mut categories = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_categories").await? {
            let name: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            categories.push((name, row.get(1).unwrap_or_default()));
        }
        Ok(categories)
    }

    async fn add_sender_rule(&self, account_id: &str, pattern: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO sender_rules (account_id, pattern, block, created_at)
                 VALUES (?1, ?2, 1, ?3)",
                params![account_id, pattern.trim().to_lowercase(), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_sender_rule: {e}")))?;
        Ok(())
    }

    async fn list_sender_rules(&self, account_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT pattern FROM sender_rules WHERE account_id = ?1 AND block = 1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sender_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_sender_rules").await? {
            if let Ok(pattern) = row.get::<String>(0) {
                rules.push(pattern);
            }
        }
        Ok(rules)
    }

    // ── Message records ─────────────────────────────────────────────

    async fn insert_record(&self, new: NewRecord<'_>) -> Result<InsertOutcome, DatabaseError> {
        let account_id = new.account.id.as_str();
        let provider_id = new.message.provider_message_id.as_str();

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.existing_outcome(account_id, provider_id).await? {
            debug!(account = %account_id, id = %provider_id, "Record already present");
            return Ok(existing);
        }

        let record_id = Uuid::new_v4().to_string();
        let conn = self.conn();
        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_record begin: {e}")))?;

        match self.write_record_rows(&record_id, &new).await {
            Ok(()) => {
                conn.execute("COMMIT", ())
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_record commit: {e}")))?;
                debug!(record = %record_id, id = %provider_id, "Record inserted");
                Ok(InsertOutcome::Inserted { record_id })
            }
            Err(e) => {
                if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                    tracing::warn!(error = %rollback, "insert_record rollback failed");
                }
                if !is_unique_violation(&e) {
                    return Err(DatabaseError::Query(format!("insert_record: {e}")));
                }
                // Lost a race against another writer of the same key.
                self.existing_outcome(account_id, provider_id)
                    .await?
                    .ok_or_else(|| DatabaseError::Constraint(format!("insert_record: {e}")))
            }
        }
    }

    async fn get_record(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let records = self
            .query_records(
                "get_record",
                &format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn get_record_by_provider_id(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        let records = self
            .query_records(
                "get_record_by_provider_id",
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM message_records
                     WHERE account_id = ?1 AND provider_message_id = ?2"
                ),
                params![account_id, provider_message_id],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn persisted_ids(
        &self,
        account_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT provider_message_id FROM message_records
                 WHERE account_id = ?1 AND NOT (state = 'PENDING' AND updated_at < ?2)",
                params![account_id, ts(stale_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persisted_ids: {e}")))?;

        let mut ids = HashSet::new();
        while let Some(row) = next_row(&mut rows, "persisted_ids").await? {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("persisted_ids row: {e}")))?;
            ids.insert(id);
        }
        Ok(ids)
    }

    async fn pending_ids(&self, account_id: &str) -> Result<HashSet<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT provider_message_id FROM message_records
                 WHERE account_id = ?1 AND state = 'PENDING'",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_ids: {e}")))?;

        let mut ids = HashSet::new();
        while let Some(row) = next_row(&mut rows, "pending_ids").await? {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("pending_ids row: {e}")))?;
            ids.insert(id);
        }
        Ok(ids)
    }

    async fn claim_stale_record(
        &self,
        record_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE message_records SET updated_at = ?1
                 WHERE id = ?2 AND state = 'PENDING' AND updated_at < ?3",
                params![ts(Utc::now()), record_id, ts(stale_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_stale_record: {e}")))?;
        Ok(affected == 1)
    }

    /// The `FAILED` source state only serves the operator retry.
    async fn mark_classified(
        &self,
        record_id: &str,
        classification: &Classification,
        attempts: u32,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE message_records SET
                    topic = ?1, importance = ?2, answer = ?3, relevance = ?4, flags = ?5,
                    summary_one_line = ?6, summary_short = ?7,
                    state = 'CLASSIFIED', attempts = ?8, last_error = NULL, updated_at = ?9
                 WHERE id = ?10 AND state IN ('PENDING', 'FAILED')",
                params![
                    classification.topic.as_str(),
                    classification.importance.as_str(),
                    classification.answer.as_str(),
                    classification.relevance.as_str(),
                    encode_flags(&classification.flags),
                    classification.summary_one_line.as_str(),
                    classification.summary_short.as_str(),
                    i64::from(attempts),
                    ts(Utc::now()),
                    record_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_classified: {e}")))?;
        Ok(affected == 1)
    }

    async fn mark_failed(
        &self,
        record_id: &str,
        attempts: u32,
        last_error: &str,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE message_records SET state = 'FAILED', attempts = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4 AND state = 'PENDING'",
                params![i64::from(attempts), last_error, ts(Utc::now()), record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(affected == 1)
    }

    async fn record_failed_retry(
        &self,
        record_id: &str,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE message_records SET attempts = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4 AND state = 'FAILED'",
                params![i64::from(attempts), last_error, ts(Utc::now()), record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_failed_retry: {e}")))?;
        Ok(())
    }

    async fn failed_records(&self, account_id: &str) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.query_records(
            "failed_records",
            &format!(
                "SELECT {RECORD_COLUMNS} FROM message_records
                 WHERE account_id = ?1 AND state = 'FAILED' ORDER BY created_at ASC"
            ),
            params![account_id],
        )
        .await
    }

    async fn count_records(&self, account_id: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM message_records WHERE account_id = ?1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(usize::try_from(row.get::<i64>(0).unwrap_or(0)).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_records: {e}"))),
        }
    }

    async fn delete_record(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let owned = "SELECT id FROM message_records WHERE account_id = ?1 AND provider_message_id = ?2";
        for table in ["participants", "attachments"] {
            conn.execute(
                &format!("DELETE FROM {table} WHERE record_id IN ({owned})"),
                params![account_id, provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_record {table}: {e}")))?;
        }
        let affected = conn
            .execute(
                "DELETE FROM message_records WHERE account_id = ?1 AND provider_message_id = ?2",
                params![account_id, provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_record: {e}")))?;
        Ok(affected > 0)
    }

    async fn list_participants(
        &self,
        record_id: &str,
    ) -> Result<Vec<(String, Participant)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role, name, address FROM participants WHERE record_id = ?1 ORDER BY rowid",
                params![record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_participants: {e}")))?;

        let mut participants = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_participants").await? {
            let role: String = row.get(0).unwrap_or_default();
            let name: Option<String> = row.get(1).ok();
            let address: String = row.get(2).unwrap_or_default();
            participants.push((role, Participant::new(name.as_deref(), &address)));
        }
        Ok(participants)
    }

    async fn list_contacts(&self, owner_id: &str) -> Result<Vec<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, name, last_seen FROM contacts WHERE owner_id = ?1 ORDER BY address",
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_contacts: {e}")))?;

        let mut contacts = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_contacts").await? {
            let last_seen: String = row.get(2).unwrap_or_default();
            contacts.push(Contact {
                address: row.get(0).unwrap_or_default(),
                name: row.get(1).ok(),
                last_seen: parse_datetime(&last_seen),
            });
        }
        Ok(contacts)
    }

    // ── Label cache ─────────────────────────────────────────────────

    async fn get_cached_labels(&self, account_id: &str) -> Result<Vec<CachedLabel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, remote_id, color FROM label_cache WHERE account_id = ?1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cached_labels: {e}")))?;

        let mut labels = Vec::new();
        while let Some(row) = next_row(&mut rows, "get_cached_labels").await? {
            labels.push(CachedLabel {
                name: row.get(0).unwrap_or_default(),
                remote_id: row.get(1).unwrap_or_default(),
                color: row.get(2).ok(),
            });
        }
        Ok(labels)
    }

    async fn put_cached_label(
        &self,
        account_id: &str,
        label: &CachedLabel,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO label_cache (account_id, name, remote_id, color, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id, name) DO UPDATE SET
                    remote_id = excluded.remote_id, color = excluded.color",
                params![
                    account_id,
                    label.name.as_str(),
                    label.remote_id.as_str(),
                    opt_text(label.color.as_deref()),
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_cached_label: {e}")))?;
        Ok(())
    }

    async fn clear_cached_labels(&self, account_id: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "DELETE FROM label_cache WHERE account_id = ?1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_cached_labels: {e}")))?;
        Ok(())
    }

    // ── Usage accounting ────────────────────────────────────────────

    async fn add_usage(
        &self,
        owner_id: &str,
        usage: &TokenUsage,
        cost: Decimal,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let now = ts(Utc::now());

        conn.execute(
            "INSERT INTO usage_totals (owner_id, input_tokens, output_tokens, cost, calls, updated_at)
             VALUES (?1, ?2, ?3, '0', 1, ?4)
             ON CONFLICT(owner_id) DO UPDATE SET
                input_tokens = usage_totals.input_tokens + excluded.input_tokens,
                output_tokens = usage_totals.output_tokens + excluded.output_tokens,
                calls = usage_totals.calls + 1,
                updated_at = excluded.updated_at",
            params![
                owner_id,
                i64::from(usage.input_tokens),
                i64::from(usage.output_tokens),
                now.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_usage: {e}")))?;

        // Decimal cost is summed exactly here rather than as a SQL REAL.
        let mut rows = conn
            .query(
                "SELECT cost FROM usage_totals WHERE owner_id = ?1",
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_usage: {e}")))?;
        let current = match rows.next().await {
            Ok(Some(row)) => parse_decimal(&row.get::<String>(0).unwrap_or_default()),
            _ => Decimal::ZERO,
        };
        conn.execute(
            "UPDATE usage_totals SET cost = ?1 WHERE owner_id = ?2",
            params![(current + cost).to_string(), owner_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_usage: {e}")))?;
        Ok(())
    }

    async fn get_usage(&self, owner_id: &str) -> Result<UsageTotals, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT input_tokens, output_tokens, cost, calls FROM usage_totals WHERE owner_id = ?1",
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_usage: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(UsageTotals {
                input_tokens: u64::try_from(row.get::<i64>(0).unwrap_or(0)).unwrap_or(0),
                output_tokens: u64::try_from(row.get::<i64>(1).unwrap_or(0)).unwrap_or(0),
                cost: parse_decimal(&row.get::<String>(2).unwrap_or_default()),
                calls: u64::try_from(row.get::<i64>(3).unwrap_or(0)).unwrap_or(0),
            }),
            Ok(None) => Ok(UsageTotals::default()),
            Err(e) => Err(DatabaseError::Query(format!("get_usage: {e}"))),
        }
    }

    async fn record_llm_call(&self, record: &LlmCallRecord<'_>) -> Result<Uuid, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO llm_calls (id, owner_id, record_id, provider, model, input_tokens, output_tokens, cost, success, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    record.owner_id,
                    opt_text(record.record_id),
                    record.provider,
                    record.model,
                    i64::from(record.usage.input_tokens),
                    i64::from(record.usage.output_tokens),
                    record.cost.to_string(),
                    i64::from(record.success),
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_llm_call: {e}")))?;
        Ok(id)
    }

    async fn bump_classification_stats(
        &self,
        owner_id: &str,
        classification: &Classification,
    ) -> Result<(), DatabaseError> {
        let mut entries = vec![
            ("topic", classification.topic.clone()),
            ("importance", classification.importance.as_str().to_string()),
            ("answer", classification.answer.as_str().to_string()),
            ("relevance", classification.relevance.as_str().to_string()),
        ];
        entries.extend(
            classification
                .flags
                .active()
                .into_iter()
                .map(|f| ("flag", f.to_string())),
        );

        let _guard = self.write_lock.lock().await;
        for (dimension, value) in entries {
            self.conn()
                .execute(
                    "INSERT INTO classification_stats (owner_id, dimension, value, count) VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(owner_id, dimension, value) DO UPDATE SET count = classification_stats.count + 1",
                    params![owner_id, dimension, value],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("bump_classification_stats: {e}")))?;
        }
        Ok(())
    }

    async fn classification_stats(
        &self,
        owner_id: &str,
    ) -> Result<Vec<(String, String, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT dimension, value, count FROM classification_stats
                 WHERE owner_id = ?1 ORDER BY dimension, value",
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("classification_stats: {e}")))?;

        let mut stats = Vec::new();
        while let Some(row) = next_row(&mut rows, "classification_stats").await? {
            stats.push((
                row.get(0).unwrap_or_default(),
                row.get(1).unwrap_or_default(),
                u64::try_from(row.get::<i64>(2).unwrap_or(0)).unwrap_or(0),
            ));
        }
        Ok(stats)
    }
}
