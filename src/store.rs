//! Shared SQLite store: schema definition and pool lifecycle.
//!
//! One pool serves every persistent concern of the core: quota counters,
//! per-user OAuth credentials, outreach messages, and cached discovery runs.
//! Each domain module owns its own queries over this pool; this module only
//! opens the database and applies the schema idempotently.
//!
//! # SQLite Write Pattern
//!
//! All writes go through plain pool statements. The hot invariants (quota
//! reserve, send claim) are enforced by single conditional statements, so
//! SQLite's writer serialization is the only lock needed. WAL mode keeps
//! readers off the writer's back.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

// ── SQL Schema ──────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quota_windows (
    subject_id   TEXT    NOT NULL,
    kind         TEXT    NOT NULL,
    count        INTEGER NOT NULL,
    window_start INTEGER NOT NULL,
    PRIMARY KEY (subject_id, kind)
);

CREATE TABLE IF NOT EXISTS user_credentials (
    user_id       TEXT PRIMARY KEY,
    access_token  TEXT    NOT NULL,
    refresh_token TEXT    NOT NULL,
    expires_at    INTEGER NOT NULL,
    updated_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    recipient     TEXT NOT NULL,
    subject       TEXT NOT NULL,
    body          TEXT NOT NULL,
    send_status   TEXT NOT NULL DEFAULT 'draft',
    outcome       TEXT NOT NULL DEFAULT 'none',
    error_message TEXT,
    sent_at       TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_user_status ON messages(user_id, send_status);

CREATE TABLE IF NOT EXISTS discovery_runs (
    opportunity_id TEXT PRIMARY KEY,
    contacts       TEXT    NOT NULL,
    total_found    INTEGER NOT NULL,
    ran_at         INTEGER NOT NULL
);
"#;

// ── Pool lifecycle ──────────────────────────────────────────────

/// Open (or create) the database file and apply the schema.
///
/// Uses WAL journal mode so quota checks and message reads do not contend
/// with in-flight sends.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the schema cannot be
/// applied.
pub async fn open(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    Ok(pool)
}

/// Open an in-memory database for testing.
///
/// Pinned to a single connection: every pooled connection to `:memory:`
/// would otherwise see its own empty database.
///
/// # Errors
///
/// Returns an error if the schema cannot be applied.
pub async fn open_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new().in_memory(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    Ok(pool)
}
