//! Ingest handler — the per-message pipeline.
//!
//! For every event from a monitored channel: capture the raw message first,
//! then classify, parse, link to the originating discovery, and fan out the
//! normalized record to every storage backend. The raw layer is idempotent by
//! `(message_id, channel_id)`; the fallible steps are retried with the shared
//! backoff policy before the event is abandoned (the raw row remains either
//! way, so backfill can pick it up later).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::time::Instant;

use crate::db::{self, CallRecord, DbError, RawMessageRow};
use crate::enrich;
use crate::linker;
use crate::parser::{looks_like_call, parse_call};
use crate::retry::Backoff;
use crate::sinks::{MultiSink, SinkError};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

// ─── Channel configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Signed chat id; channels are negative.
    pub channel_id: i64,
    pub channel_name: String,
    pub is_active: bool,
    /// Events per minute; 0 disables the rate-limit delay.
    pub rate_limit: u32,
}

// ─── Stream events ───────────────────────────────────────────────────────────

/// A transport-agnostic message event delivered by the stream source.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub channel_id: i64,
    pub message_id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
    pub reply_to_message_id: Option<i64>,
}

// ─── Per-channel stats ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_processing_secs: f64,
}

impl ChannelStats {
    pub fn average_processing_secs(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_processing_secs / self.total as f64
        }
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

pub struct MessageHandler {
    channels: HashMap<i64, ChannelConfig>,
    pool: SqlitePool,
    sinks: MultiSink,
    retry: Backoff,
    stats: HashMap<i64, ChannelStats>,
}

impl MessageHandler {
    pub fn new(channels: Vec<ChannelConfig>, pool: SqlitePool, sinks: MultiSink) -> Self {
        info!("message handler ready for {} channels", channels.len());
        MessageHandler {
            channels: channels.into_iter().map(|c| (c.channel_id, c)).collect(),
            pool,
            sinks,
            retry: Backoff::new(3, Duration::from_secs(1), Duration::from_secs(30)),
            stats: HashMap::new(),
        }
    }

    pub fn is_channel_active(&self, channel_id: i64) -> bool {
        self.channels.get(&channel_id).is_some_and(|c| c.is_active)
    }

    pub fn stats(&self, channel_id: i64) -> Option<&ChannelStats> {
        self.stats.get(&channel_id)
    }

    pub fn sinks_mut(&mut self) -> &mut MultiSink {
        &mut self.sinks
    }

    /// `(healthy, total)` backend counts for the periodic health log.
    pub fn sink_health(&self) -> (usize, usize) {
        (self.sinks.healthy_count(), self.sinks.sink_count())
    }

    /// Log a per-channel summary; called on shutdown.
    pub fn log_stats(&self) {
        for (channel_id, stats) in &self.stats {
            info!(
                "channel {channel_id}: {}/{} events processed ok, avg {:.2}s",
                stats.succeeded,
                stats.total,
                stats.average_processing_secs()
            );
        }
    }

    /// Process one event. Returns `Ok(true)` when a normalized record was
    /// stored, `Ok(false)` when the event was dropped or didn't parse.
    pub async fn handle_event(&mut self, event: &StreamEvent) -> Result<bool, HandlerError> {
        // Admission: only configured, active channels.
        let Some(config) = self.channels.get(&event.channel_id).cloned() else {
            debug!("ignoring message from unknown channel {}", event.channel_id);
            return Ok(false);
        };
        if !config.is_active {
            debug!("ignoring message from inactive channel {}", event.channel_id);
            return Ok(false);
        }

        let started = Instant::now();
        let outcome = self.process(&config, event).await;

        let stats = self.stats.entry(event.channel_id).or_default();
        stats.total += 1;
        stats.total_processing_secs += started.elapsed().as_secs_f64();
        match &outcome {
            Ok(_) => stats.succeeded += 1,
            Err(_) => stats.failed += 1,
        }

        outcome
    }

    async fn process(
        &mut self,
        config: &ChannelConfig,
        event: &StreamEvent,
    ) -> Result<bool, HandlerError> {
        let timestamp = event.date.to_rfc3339();
        let raw = RawMessageRow {
            message_id: event.message_id,
            channel_id: event.channel_id,
            channel_name: config.channel_name.clone(),
            message_text: event.text.clone(),
            message_date: timestamp.clone(),
            reply_to_message_id: event.reply_to_message_id,
            is_classified: false,
            classification_result: None,
        };

        // Raw capture happens before any interpretation. A failure here is
        // logged but the downstream attempt continues.
        if let Err(e) = self.sinks.append_raw(&raw).await {
            error!("failed to capture raw message {}: {e}", event.message_id);
        }

        // Cheap pre-filter; the parser is authoritative.
        if !looks_like_call(&event.text) {
            debug!("message {} is not call-shaped", event.message_id);
            return Ok(false);
        }

        let Some(parsed) = parse_call(&event.text) else {
            debug!("message {} did not parse", event.message_id);
            if let Err(e) =
                db::mark_raw_classified(&self.pool, event.channel_id, event.message_id, "no_match")
                    .await
            {
                error!("could not record no-match for message {}: {e}", event.message_id);
            }
            return Ok(false);
        };

        let mut record = CallRecord::from_parsed(
            &parsed,
            event.message_id,
            event.channel_id,
            &config.channel_name,
            &timestamp,
        );
        enrich::enrich_with_price(&mut record).await;

        // Link & inherit, retried on store errors.
        let pool = self.pool.clone();
        let retry = self.retry;
        retry
            .retry("link", &mut record, |rec| {
                let pool = pool.clone();
                let raw = raw.clone();
                Box::pin(async move { linker::link_and_inherit(&pool, &raw, rec).await })
            })
            .await?;

        // Cooperative per-channel rate limit before fan-out.
        if config.rate_limit > 0 {
            tokio::time::sleep(Duration::from_secs_f64(60.0 / config.rate_limit as f64)).await;
        }

        retry
            .retry("fan-out", &mut self.sinks, |sinks| {
                let rec = record.clone();
                Box::pin(async move { sinks.append(&rec).await })
            })
            .await?;

        if let Err(e) = db::mark_raw_classified(
            &self.pool,
            event.channel_id,
            event.message_id,
            record.message_type.as_str(),
        )
        .await
        {
            error!("could not record classification for message {}: {e}", event.message_id);
        }

        info!(
            "processed {} call from message {} in channel {}",
            record.message_type, event.message_id, event.channel_id
        );
        Ok(true)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MessageType;
    use crate::sinks::testing::MockSink;
    use crate::sinks::SqliteSink;
    use sqlx::Row;

    const CHANNEL_ID: i64 = -1002380293749;
    const CHANNEL: &str = "Pumpfun Ultimate Alert";

    fn event(message_id: i64, text: &str, reply_to: Option<i64>) -> StreamEvent {
        StreamEvent {
            channel_id: CHANNEL_ID,
            message_id,
            text: text.to_string(),
            date: Utc::now(),
            reply_to_message_id: reply_to,
        }
    }

    fn config() -> ChannelConfig {
        ChannelConfig {
            channel_id: CHANNEL_ID,
            channel_name: CHANNEL.to_string(),
            is_active: true,
            rate_limit: 0,
        }
    }

    async fn handler_with_store() -> (MessageHandler, SqlitePool) {
        let pool = crate::db::tests::test_pool().await;
        let sinks = MultiSink::new(Box::new(SqliteSink::new(pool.clone())), vec![]);
        (MessageHandler::new(vec![config()], pool.clone(), sinks), pool)
    }

    #[tokio::test]
    async fn discovery_then_reply_update_end_to_end() {
        let (mut handler, pool) = handler_with_store().await;

        let stored = handler
            .handle_event(&event(
                1001,
                "[Bean Cabal (CABAL)](http://x) `944XTHEz...pump` `Cap:` **45.9K**",
                None,
            ))
            .await
            .unwrap();
        assert!(stored);

        let stored = handler
            .handle_event(&event(
                1002,
                "🎉 2.6x | 💹From 45.9K ↗️ 115.0K within 8m",
                Some(1001),
            ))
            .await
            .unwrap();
        assert!(stored);

        let discovery = db::find_call_by_message_id(&pool, CHANNEL, 1001)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discovery.message_type, MessageType::Discovery);
        assert_eq!(discovery.token_name.as_deref(), Some("Bean Cabal (CABAL)"));
        assert_eq!(discovery.entry_cap, Some(45_900.0));
        assert_eq!(discovery.x_gain, Some(1.0));
        assert_eq!(discovery.linked_crypto_call_id, None);

        let update = db::find_call_by_message_id(&pool, CHANNEL, 1002)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.message_type, MessageType::Update);
        assert_eq!(update.token_name.as_deref(), Some("Bean Cabal (CABAL)"));
        assert_eq!(update.entry_cap, Some(45_900.0));
        assert_eq!(update.peak_cap, Some(115_000.0));
        assert_eq!(update.x_gain, Some(2.6));
        assert_eq!(update.vip_x, None);
        assert_eq!(update.time_to_peak.as_deref(), Some("8m"));
        assert_eq!(update.linked_crypto_call_id, Some(discovery.id));

        // Every call has its raw row, and the store is internally consistent.
        assert!(db::calls_without_raw(&pool).await.unwrap().is_empty());
        assert!(db::broken_links(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_inactive_channels_are_dropped() {
        let pool = crate::db::tests::test_pool().await;
        let sinks = MultiSink::new(Box::new(SqliteSink::new(pool.clone())), vec![]);
        let mut inactive = config();
        inactive.is_active = false;
        let mut handler = MessageHandler::new(vec![inactive], pool.clone(), sinks);
        assert!(!handler.is_channel_active(CHANNEL_ID));
        assert!(!handler.is_channel_active(-999));

        let mut ev = event(1, "🎉 2.6x | 💹From 45.9K ↗️ 115.0K within 8m", None);
        assert!(!handler.handle_event(&ev).await.unwrap());

        ev.channel_id = -999; // unknown
        assert!(!handler.handle_event(&ev).await.unwrap());

        // Nothing captured, not even raw rows.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let (mut handler, pool) = handler_with_store().await;
        let ev = event(
            1001,
            "[Bean Cabal (CABAL)](http://x) `944XTHEz...pump` `Cap:` **45.9K**",
            None,
        );

        handler.handle_event(&ev).await.unwrap();
        handler.handle_event(&ev).await.unwrap();

        let raws: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        let calls: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crypto_calls")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(raws, 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn no_match_is_recorded_on_the_raw_row() {
        let (mut handler, pool) = handler_with_store().await;

        // Classifier-shaped (entry/peak + mc) but unparseable: peak has no number.
        let stored = handler
            .handle_event(&event(5, "Entry: 45K MC Peak: soon", None))
            .await
            .unwrap();
        assert!(!stored);

        let row = sqlx::query("SELECT * FROM raw_messages WHERE message_id = 5")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("is_classified"), 1);
        assert_eq!(
            row.get::<Option<String>, _>("classification_result").as_deref(),
            Some("no_match")
        );

        // A message the classifier rejects outright stays unclassified.
        handler.handle_event(&event(6, "gm frens", None)).await.unwrap();
        let row = sqlx::query("SELECT * FROM raw_messages WHERE message_id = 6")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("is_classified"), 0);
    }

    #[tokio::test]
    async fn successful_parse_marks_the_raw_row_with_its_type() {
        let (mut handler, pool) = handler_with_store().await;
        handler
            .handle_event(&event(7, "XYZ has bonded — achievement unlocked", None))
            .await
            .unwrap();

        let row = sqlx::query("SELECT * FROM raw_messages WHERE message_id = 7")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(
            row.get::<Option<String>, _>("classification_result").as_deref(),
            Some("bonding")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn primary_failure_recovers_on_retry() {
        let pool = crate::db::tests::test_pool().await;

        // The discovery the update will link against.
        let disc_id = db::insert_call(
            &pool,
            &crate::db::tests::discovery_record(
                2001,
                "TOK",
                &(Utc::now() - chrono::Duration::minutes(10)).to_rfc3339(),
            ),
        )
        .await
        .unwrap();

        // Primary fails once, succeeds on the handler's retry.
        let (primary, state) = MockSink::new("sqlite");
        state.lock().unwrap().fail_script.push_back(true);
        let sinks = MultiSink::new(Box::new(primary), vec![]);
        let mut handler = MessageHandler::new(vec![config()], pool.clone(), sinks);

        let stored = handler
            .handle_event(&event(
                2002,
                "🎉 2.6x | 💹From 45.9K ↗️ 115.0K within 8m",
                Some(2001),
            ))
            .await
            .unwrap();
        assert!(stored);

        let appended = &state.lock().unwrap().appended;
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].linked_crypto_call_id, Some(disc_id));
        assert_eq!(appended[0].token_name.as_deref(), Some("TOK"));
    }

    #[tokio::test(start_paused = true)]
    async fn event_is_abandoned_after_retries_exhaust() {
        let pool = crate::db::tests::test_pool().await;
        let (primary, state) = MockSink::failing("sqlite");
        let sinks = MultiSink::new(Box::new(primary), vec![]);
        let mut handler = MessageHandler::new(vec![config()], pool.clone(), sinks);

        let result = handler
            .handle_event(&event(3001, "🎉 2.6x | 💹From 45.9K ↗️ 115.0K within 8m", None))
            .await;
        assert!(result.is_err());
        assert!(state.lock().unwrap().appended.is_empty());

        let stats = handler.stats(CHANNEL_ID).unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_delays_fan_out() {
        let pool = crate::db::tests::test_pool().await;
        let sinks = MultiSink::new(Box::new(SqliteSink::new(pool.clone())), vec![]);
        let mut cfg = config();
        cfg.rate_limit = 60; // one per second
        let mut handler = MessageHandler::new(vec![cfg], pool.clone(), sinks);

        let start = tokio::time::Instant::now();
        handler
            .handle_event(&event(
                4001,
                "[Tok (TOK)](http://x) `Cap:` **45.9K**",
                None,
            ))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
