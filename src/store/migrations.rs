//! Schema migrations for the mail store.
//!
//! V1 holds accounts, message records and their related rows; V2 adds usage
//! accounting; V3 adds push subscription columns to accounts. Applied
//! versions are tracked in `_migrations`.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version; append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                address TEXT NOT NULL UNIQUE,
                credential_ref TEXT NOT NULL,
                server TEXT,
                ai_backend TEXT,
                cursor TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner_id);

            CREATE TABLE IF NOT EXISTS message_records (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                provider_message_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                sender_name TEXT,
                sender_address TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                is_reply INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                topic TEXT,
                importance TEXT,
                answer TEXT,
                relevance TEXT,
                flags TEXT,
                summary_one_line TEXT,
                summary_short TEXT,
                state TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (account_id, provider_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_state ON message_records(account_id, state);

            CREATE TABLE IF NOT EXISTS participants (
                record_id TEXT NOT NULL REFERENCES message_records(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                name TEXT,
                address TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_participants_record ON participants(record_id);

            CREATE TABLE IF NOT EXISTS attachments (
                record_id TEXT NOT NULL REFERENCES message_records(id) ON DELETE CASCADE,
                provider_attachment_id TEXT,
                filename TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_record ON attachments(record_id);

            CREATE TABLE IF NOT EXISTS contacts (
                owner_id TEXT NOT NULL,
                address TEXT NOT NULL,
                name TEXT,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (owner_id, address)
            );

            CREATE TABLE IF NOT EXISTS categories (
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (account_id, name)
            );

            CREATE TABLE IF NOT EXISTS sender_rules (
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                pattern TEXT NOT NULL,
                block INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                PRIMARY KEY (account_id, pattern)
            );

            CREATE TABLE IF NOT EXISTS label_cache (
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                color TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (account_id, name)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "usage_tracking",
        sql: r#"
            CREATE TABLE IF NOT EXISTS usage_totals (
                owner_id TEXT PRIMARY KEY,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost TEXT NOT NULL DEFAULT '0',
                calls INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS classification_stats (
                owner_id TEXT NOT NULL,
                dimension TEXT NOT NULL,
                value TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner_id, dimension, value)
            );

            CREATE TABLE IF NOT EXISTS llm_calls (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                record_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost TEXT NOT NULL DEFAULT '0',
                success INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_llm_calls_owner ON llm_calls(owner_id);
            CREATE INDEX IF NOT EXISTS idx_llm_calls_created ON llm_calls(created_at);
        "#,
    },
    Migration {
        version: 3,
        name: "push_subscriptions",
        sql: r#"
            ALTER TABLE accounts ADD COLUMN watch_id TEXT;
            ALTER TABLE accounts ADD COLUMN watch_expires_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_accounts_watch ON accounts(watch_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
