//! Offline backfill — re-run parse and link over captured messages that
//! never produced a normalized record.
//!
//! Uses the same parser and the same (conservative) linker as the live path,
//! so a repaired row is indistinguishable from one ingested live. Processed
//! raw rows are marked `backfilled`; the unique call index makes re-runs
//! insert nothing new.

use chrono::{Duration, Utc};
use log::{debug, error, info};
use sqlx::SqlitePool;

use crate::db::{self, CallRecord, DbError};
use crate::linker::{self, LinkMethod};
use crate::parser::parse_call;

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Only consider messages newer than this many hours.
    pub since_hours: i64,
    pub batch_size: i64,
    /// Stop after processing this many messages; 0 means no cap.
    pub limit: i64,
    /// Parse and link but write nothing.
    pub dry_run: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        BackfillOptions { since_hours: 24, batch_size: 500, limit: 0, dry_run: false }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub processed: u64,
    pub parsed: u64,
    pub linked_by_reply: u64,
    pub linked_by_heuristic: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
}

pub async fn run(pool: &SqlitePool, opts: &BackfillOptions) -> Result<BackfillStats, DbError> {
    let since = (Utc::now() - Duration::hours(opts.since_hours)).to_rfc3339();
    let mut stats = BackfillStats::default();
    let mut offset = 0i64;
    let mut batch_num = 0u64;

    loop {
        let messages =
            db::unprocessed_raw_messages(pool, &since, opts.batch_size, offset).await?;
        if messages.is_empty() {
            info!("no more unprocessed messages");
            break;
        }
        batch_num += 1;
        info!("batch {batch_num}: {} messages", messages.len());

        let mut inserted_in_batch = 0i64;
        for raw in &messages {
            stats.processed += 1;

            let Some(parsed) = parse_call(&raw.message_text) else {
                stats.skipped += 1;
                debug!("message {} still does not parse", raw.message_id);
                continue;
            };
            stats.parsed += 1;

            let mut record = CallRecord::from_parsed(
                &parsed,
                raw.message_id,
                raw.channel_id,
                &raw.channel_name,
                &raw.message_date,
            );

            match linker::link_and_inherit(pool, raw, &mut record).await {
                Ok(Some(LinkMethod::Reply)) => stats.linked_by_reply += 1,
                Ok(Some(_)) => stats.linked_by_heuristic += 1,
                Ok(None) => {}
                Err(e) => {
                    stats.errors += 1;
                    error!("linking message {} failed: {e}", raw.message_id);
                    continue;
                }
            }

            if !opts.dry_run {
                if let Err(e) = db::insert_call(pool, &record).await {
                    stats.errors += 1;
                    error!("inserting call for message {} failed: {e}", raw.message_id);
                    continue;
                }
            }
            stats.inserted += 1;
            inserted_in_batch += 1;
            debug!(
                "backfilled message {} as {} (link: {:?})",
                raw.message_id, record.message_type, record.linked_crypto_call_id
            );
        }

        if !opts.dry_run {
            for raw in &messages {
                if let Err(e) =
                    db::mark_raw_classified(pool, raw.channel_id, raw.message_id, "backfilled")
                        .await
                {
                    error!("marking message {} failed: {e}", raw.message_id);
                }
            }
        }

        // Inserted rows drop out of the unprocessed scan, so only the ones
        // still lacking a call advance the page offset.
        offset += messages.len() as i64 - inserted_in_batch;

        if opts.limit > 0 && stats.processed >= opts.limit as u64 {
            info!("reached limit of {} messages", opts.limit);
            break;
        }
        if (messages.len() as i64) < opts.batch_size {
            break;
        }
    }

    Ok(stats)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
