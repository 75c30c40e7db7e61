//! Discovery link resolution and field inheritance.
//!
//! Given a parsed record and its captured message, find the discovery it
//! belongs to. Candidate sources in fixed priority, first hit wins: the
//! in-band reply reference, then an exact contract-address match, then a
//! case-insensitive token-name match — both heuristics scoped to the same
//! channel and a 24-hour window. Market-cap matching is deliberately absent:
//! updates repeat their discovery's entry cap by construction, so it collides
//! across tokens.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use sqlx::SqlitePool;

use crate::db::{self, CallRecord, CryptoCallRow, DbError, RawMessageRow};
use crate::parser::MessageType;

/// How an update found its discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMethod {
    Reply,
    ContractAddress,
    TokenName,
}

impl LinkMethod {
    /// Reply comes from the transport itself; the other two are inferred.
    pub fn is_heuristic(self) -> bool {
        !matches!(self, LinkMethod::Reply)
    }
}

const LINK_WINDOW_HOURS: i64 = 24;

/// Resolve the discovery link for `record` and inherit missing fields from
/// the parent. Discoveries are left untouched.
pub async fn link_and_inherit(
    pool: &SqlitePool,
    raw: &RawMessageRow,
    record: &mut CallRecord,
) -> Result<Option<LinkMethod>, DbError> {
    if record.message_type == MessageType::Discovery {
        return Ok(None);
    }

    // The candidate window is anchored at the event's own timestamp so the
    // live path and backfill agree on old data.
    let since = window_start(&record.timestamp);

    // Priority 1: reply reference — authoritative, it is explicit in the
    // transport. The target must itself be a discovery; a reply pointing at
    // another update falls through to the heuristics.
    if let Some(reply_id) = raw.reply_to_message_id {
        if let Some(parent) =
            db::find_call_by_message_id(pool, &raw.channel_name, reply_id).await?
        {
            if parent.message_type == MessageType::Discovery {
                debug!(
                    "message {} linked via reply to discovery {}",
                    record.message_id, parent.id
                );
                adopt(record, &parent);
                return Ok(Some(LinkMethod::Reply));
            }
        }
    }

    // Priority 2: exact contract address.
    if let Some(contract) = record.contract_address.clone() {
        if let Some(parent_id) =
            db::find_recent_discovery_by_contract(pool, &record.channel_name, &contract, &since)
                .await?
        {
            if let Some(parent) = db::get_call(pool, parent_id).await? {
                debug!(
                    "message {} linked via contract address to discovery {parent_id}",
                    record.message_id
                );
                adopt(record, &parent);
                return Ok(Some(LinkMethod::ContractAddress));
            }
        }
    }

    // Priority 3: exact token name, case-insensitive.
    if let Some(token) = record.token_name.clone() {
        if let Some(parent_id) =
            db::find_recent_discovery_by_token(pool, &record.channel_name, &token, &since).await?
        {
            if let Some(parent) = db::get_call(pool, parent_id).await? {
                debug!(
                    "message {} linked via token name {token:?} to discovery {parent_id}",
                    record.message_id
                );
                adopt(record, &parent);
                return Ok(Some(LinkMethod::TokenName));
            }
        }
    }

    debug!("no reliable link for message {}", record.message_id);
    Ok(None)
}

/// Point `record` at `parent` and fill its null fields from the parent.
/// Inheritance never overwrites a value the parser extracted.
fn adopt(record: &mut CallRecord, parent: &CryptoCallRow) {
    record.linked_crypto_call_id = Some(parent.id);
    if record.token_name.is_none() {
        record.token_name = parent.token_name.clone();
    }
    if record.contract_address.is_none() {
        record.contract_address = parent.contract_address.clone();
    }
}

fn window_start(timestamp: &str) -> String {
    let anchor = DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    (anchor - Duration::hours(LINK_WINDOW_HOURS)).to_rfc3339()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
