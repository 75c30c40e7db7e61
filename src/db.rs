//! Primary store — SQLite, the single source of truth.
//!
//! Owns both tables: `raw_messages` (every message captured before any
//! interpretation) and `crypto_calls` (the normalized analytic records).
//! The linker's lookups run against this store only; secondary sinks never
//! serve reads.

use std::path::Path;

use log::warn;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::parser::{MessageType, ParsedCall};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Open / schema ───────────────────────────────────────────────────────────

/// Open (creating if needed) the store at `path` and apply migrations.
///
/// A single connection: reads and writes are serialized through it, which is
/// the concurrency contract the handler and linker rely on. Foreign keys are
/// declared but not enforced — a write whose link target went missing still
/// lands, and the integrity checks surface it afterwards.
pub async fn open(path: &Path) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(false);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Create all tables if they don't already exist and apply additive column
/// migrations so databases written by earlier schema revisions upgrade in
/// place without losing rows.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS crypto_calls (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            token_name              TEXT,
            entry_cap               REAL,
            peak_cap                REAL,
            x_gain                  REAL,
            vip_x                   REAL,
            message_type            TEXT,
            contract_address        TEXT,
            time_to_peak            TEXT,
            linked_crypto_call_id   INTEGER REFERENCES crypto_calls(id),
            timestamp               TEXT,
            message_id              INTEGER,
            channel_id              INTEGER,
            channel_name            TEXT,
            created_at              DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS raw_messages (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id              INTEGER NOT NULL,
            channel_id              INTEGER NOT NULL,
            channel_name            TEXT,
            message_text            TEXT,
            message_date            TEXT,
            reply_to_message_id     INTEGER,
            is_classified           BOOLEAN DEFAULT FALSE,
            classification_result   TEXT,
            created_at              DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(message_id, channel_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // ── Additive migrations (safe to re-run: duplicate-column errors are
    // swallowed). These upgrade databases created by the first schema
    // revision, which stored eight call columns and no reply reference. ──────
    let additive = [
        "ALTER TABLE crypto_calls ADD COLUMN message_type TEXT",
        "ALTER TABLE crypto_calls ADD COLUMN contract_address TEXT",
        "ALTER TABLE crypto_calls ADD COLUMN time_to_peak TEXT",
        "ALTER TABLE crypto_calls ADD COLUMN linked_crypto_call_id INTEGER",
        "ALTER TABLE crypto_calls ADD COLUMN channel_id INTEGER",
        "ALTER TABLE raw_messages ADD COLUMN reply_to_message_id INTEGER",
        "ALTER TABLE raw_messages ADD COLUMN classification_result TEXT",
    ];
    for sql in &additive {
        let _ = sqlx::query(sql).execute(pool).await;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_crypto_calls_message_id ON crypto_calls (message_id)",
    )
    .execute(pool)
    .await?;

    // Makes the normalized layer idempotent: a handler retry or a backfill
    // re-run cannot insert the same event twice. Creation fails only when a
    // legacy database already holds duplicates; keep going without it.
    if let Err(e) = sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_crypto_calls_identity \
         ON crypto_calls (channel_id, message_id)",
    )
    .execute(pool)
    .await
    {
        warn!("could not create unique call index (duplicate legacy rows?): {e}");
    }

    Ok(())
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// One captured message, persisted before any interpretation.
#[derive(Debug, Clone)]
pub struct RawMessageRow {
    pub message_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub message_text: String,
    /// Source timestamp, RFC 3339.
    pub message_date: String,
    pub reply_to_message_id: Option<i64>,
    pub is_classified: bool,
    pub classification_result: Option<String>,
}

/// The normalized record handed to the sink coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub token_name: Option<String>,
    pub entry_cap: Option<f64>,
    pub peak_cap: Option<f64>,
    pub x_gain: Option<f64>,
    pub vip_x: Option<f64>,
    pub message_type: MessageType,
    pub contract_address: Option<String>,
    pub time_to_peak: Option<String>,
    pub linked_crypto_call_id: Option<i64>,
    /// Source event time, RFC 3339.
    pub timestamp: String,
    pub message_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
}

impl CallRecord {
    /// Combine parsed fields with message metadata. The link is filled in by
    /// the linker afterwards.
    pub fn from_parsed(
        parsed: &ParsedCall,
        message_id: i64,
        channel_id: i64,
        channel_name: &str,
        timestamp: &str,
    ) -> Self {
        CallRecord {
            token_name: parsed.token_name.clone(),
            entry_cap: parsed.entry_cap,
            peak_cap: parsed.peak_cap,
            x_gain: parsed.x_gain,
            vip_x: parsed.vip_x,
            message_type: parsed.message_type,
            contract_address: parsed.contract_address.clone(),
            time_to_peak: parsed.time_to_peak.clone(),
            linked_crypto_call_id: None,
            timestamp: timestamp.to_string(),
            message_id,
            channel_id,
            channel_name: channel_name.to_string(),
        }
    }
}

/// A stored normalized record.
#[derive(Debug, Clone)]
pub struct CryptoCallRow {
    pub id: i64,
    pub token_name: Option<String>,
    pub entry_cap: Option<f64>,
    pub peak_cap: Option<f64>,
    pub x_gain: Option<f64>,
    pub vip_x: Option<f64>,
    pub message_type: MessageType,
    pub contract_address: Option<String>,
    pub time_to_peak: Option<String>,
    pub linked_crypto_call_id: Option<i64>,
    pub timestamp: Option<String>,
    pub message_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub channel_name: Option<String>,
}

fn call_row(r: sqlx::sqlite::SqliteRow) -> CryptoCallRow {
    CryptoCallRow {
        id: r.get("id"),
        token_name: r.get("token_name"),
        entry_cap: r.get("entry_cap"),
        peak_cap: r.get("peak_cap"),
        x_gain: r.get("x_gain"),
        vip_x: r.get("vip_x"),
        message_type: MessageType::from_str(
            &r.get::<Option<String>, _>("message_type").unwrap_or_default(),
        ),
        contract_address: r.get("contract_address"),
        time_to_peak: r.get("time_to_peak"),
        linked_crypto_call_id: r.get("linked_crypto_call_id"),
        timestamp: r.get("timestamp"),
        message_id: r.get("message_id"),
        channel_id: r.get("channel_id"),
        channel_name: r.get("channel_name"),
    }
}

// ─── Raw messages ────────────────────────────────────────────────────────────

/// Idempotent capture by `(message_id, channel_id)`. Re-delivery refreshes
/// the message content but preserves `created_at` and any classification
/// already recorded.
pub async fn upsert_raw_message(pool: &SqlitePool, row: &RawMessageRow) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO raw_messages
               (message_id, channel_id, channel_name, message_text, message_date, reply_to_message_id)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(message_id, channel_id) DO UPDATE SET
               channel_name        = excluded.channel_name,
               message_text        = excluded.message_text,
               message_date        = excluded.message_date,
               reply_to_message_id = excluded.reply_to_message_id"#,
    )
    .bind(row.message_id)
    .bind(row.channel_id)
    .bind(&row.channel_name)
    .bind(&row.message_text)
    .bind(&row.message_date)
    .bind(row.reply_to_message_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the classification outcome on a captured message.
pub async fn mark_raw_classified(
    pool: &SqlitePool,
    channel_id: i64,
    message_id: i64,
    result: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE raw_messages SET is_classified = 1, classification_result = ?
         WHERE channel_id = ? AND message_id = ?",
    )
    .bind(result)
    .bind(channel_id)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Captured messages newer than `since` (RFC 3339) that never produced a
/// normalized record, oldest first so discoveries are seen before the
/// updates that reference them. Paged for the backfill job.
pub async fn unprocessed_raw_messages(
    pool: &SqlitePool,
    since: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<RawMessageRow>, DbError> {
    let rows = sqlx::query(
        r#"SELECT rm.message_id, rm.channel_id, rm.channel_name, rm.message_text,
                  rm.message_date, rm.reply_to_message_id, rm.is_classified,
                  rm.classification_result
           FROM raw_messages rm
           LEFT JOIN crypto_calls cc
               ON cc.message_id = rm.message_id AND cc.channel_id = rm.channel_id
           WHERE cc.id IS NULL
             AND datetime(rm.message_date) >= datetime(?)
           ORDER BY rm.message_date ASC
           LIMIT ? OFFSET ?"#,
    )
    .bind(since)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| RawMessageRow {
            message_id: r.get("message_id"),
            channel_id: r.get("channel_id"),
            channel_name: r.get::<Option<String>, _>("channel_name").unwrap_or_default(),
            message_text: r.get::<Option<String>, _>("message_text").unwrap_or_default(),
            message_date: r.get::<Option<String>, _>("message_date").unwrap_or_default(),
            reply_to_message_id: r.get("reply_to_message_id"),
            is_classified: r.get::<i64, _>("is_classified") != 0,
            classification_result: r.get("classification_result"),
        })
        .collect())
}

// ─── Crypto calls ────────────────────────────────────────────────────────────

/// Insert a normalized record, returning its id. A record for the same
/// `(channel_id, message_id)` already present is left untouched and its id
/// returned, so retries and backfill re-runs cannot duplicate.
pub async fn insert_call(pool: &SqlitePool, rec: &CallRecord) -> Result<i64, DbError> {
    let result = sqlx::query(
        r#"INSERT INTO crypto_calls
               (token_name, entry_cap, peak_cap, x_gain, vip_x, message_type,
                contract_address, time_to_peak, linked_crypto_call_id,
                timestamp, message_id, channel_id, channel_name)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT DO NOTHING"#,
    )
    .bind(&rec.token_name)
    .bind(rec.entry_cap)
    .bind(rec.peak_cap)
    .bind(rec.x_gain)
    .bind(rec.vip_x)
    .bind(rec.message_type.as_str())
    .bind(&rec.contract_address)
    .bind(&rec.time_to_peak)
    .bind(rec.linked_crypto_call_id)
    .bind(&rec.timestamp)
    .bind(rec.message_id)
    .bind(rec.channel_id)
    .bind(&rec.channel_name)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(result.last_insert_rowid());
    }

    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM crypto_calls WHERE channel_id = ? AND message_id = ? LIMIT 1",
    )
    .bind(rec.channel_id)
    .bind(rec.message_id)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_call(pool: &SqlitePool, id: i64) -> Result<Option<CryptoCallRow>, DbError> {
    let row = sqlx::query("SELECT * FROM crypto_calls WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(call_row))
}

/// The stored call originating from a specific source message, if any.
pub async fn find_call_by_message_id(
    pool: &SqlitePool,
    channel_name: &str,
    message_id: i64,
) -> Result<Option<CryptoCallRow>, DbError> {
    let row = sqlx::query(
        "SELECT * FROM crypto_calls WHERE message_id = ? AND channel_name = ? LIMIT 1",
    )
    .bind(message_id)
    .bind(channel_name)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(call_row))
}

/// Most recent same-channel discovery with this contract address at or after
/// `since` (RFC 3339).
pub async fn find_recent_discovery_by_contract(
    pool: &SqlitePool,
    channel_name: &str,
    contract_address: &str,
    since: &str,
) -> Result<Option<i64>, DbError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"SELECT id FROM crypto_calls
           WHERE contract_address = ?
             AND message_type = 'discovery'
             AND channel_name = ?
             AND datetime(timestamp) >= datetime(?)
           ORDER BY timestamp DESC
           LIMIT 1"#,
    )
    .bind(contract_address)
    .bind(channel_name)
    .bind(since)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Most recent same-channel discovery with a case-insensitive token-name
/// match at or after `since` (RFC 3339).
pub async fn find_recent_discovery_by_token(
    pool: &SqlitePool,
    channel_name: &str,
    token_name: &str,
    since: &str,
) -> Result<Option<i64>, DbError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"SELECT id FROM crypto_calls
           WHERE LOWER(token_name) = LOWER(?)
             AND message_type = 'discovery'
             AND channel_name = ?
             AND datetime(timestamp) >= datetime(?)
           ORDER BY timestamp DESC
           LIMIT 1"#,
    )
    .bind(token_name)
    .bind(channel_name)
    .bind(since)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

// ─── Integrity checks ────────────────────────────────────────────────────────

/// `(call id, linked id)` pairs whose link target is missing or is not a
/// discovery. Empty on a healthy store.
pub async fn broken_links(pool: &SqlitePool) -> Result<Vec<(i64, i64)>, DbError> {
    let rows = sqlx::query(
        r#"SELECT c.id AS id, c.linked_crypto_call_id AS linked
           FROM crypto_calls c
           LEFT JOIN crypto_calls p ON p.id = c.linked_crypto_call_id
           WHERE c.linked_crypto_call_id IS NOT NULL
             AND (p.id IS NULL OR p.message_type != 'discovery')"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| (r.get("id"), r.get("linked"))).collect())
}

/// Ids of normalized records with no matching captured message.
pub async fn calls_without_raw(pool: &SqlitePool) -> Result<Vec<i64>, DbError> {
    let rows = sqlx::query(
        r#"SELECT c.id AS id
           FROM crypto_calls c
           LEFT JOIN raw_messages rm
               ON rm.message_id = c.message_id AND rm.channel_id = c.channel_id
           WHERE rm.id IS NULL"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("id")).collect())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
