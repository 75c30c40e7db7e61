//! Multi-sink fan-out.
//!
//! An ordered set of storage backends: the first is the primary (SQLite,
//! required — it also serves the linker's reads), the rest are best-effort
//! mirrors. A write succeeds when at least one sink accepted it; only when
//! every sink fails does the coordinator raise, letting the handler retry.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::db::{self, CallRecord, DbError, RawMessageRow};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("io error: {0}")]
    Io(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("sink is closed")]
    Closed,
    #[error("all sinks failed: {0}")]
    AllFailed(String),
}

// ─── Sink trait ──────────────────────────────────────────────────────────────

/// Column order shared by every secondary sink (headers and row cells).
pub const CALL_COLUMNS: [&str; 12] = [
    "token_name",
    "entry_cap",
    "peak_cap",
    "x_gain",
    "vip_x",
    "message_type",
    "contract_address",
    "time_to_peak",
    "linked_crypto_call_id",
    "timestamp",
    "message_id",
    "channel_name",
];

/// A storage backend for normalized records.
#[async_trait]
pub trait CallSink: Send {
    fn name(&self) -> &'static str;

    async fn append_call(&mut self, record: &CallRecord) -> Result<(), SinkError>;

    /// Raw message capture. Secondary sinks store normalized records only, so
    /// the default does nothing.
    async fn append_raw(&mut self, _raw: &RawMessageRow) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError>;
}

// ─── Primary sink ────────────────────────────────────────────────────────────

/// The SQLite primary store behind the [`CallSink`] seam.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteSink { pool }
    }
}

#[async_trait]
impl CallSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append_call(&mut self, record: &CallRecord) -> Result<(), SinkError> {
        db::insert_call(&self.pool, record).await?;
        Ok(())
    }

    async fn append_raw(&mut self, raw: &RawMessageRow) -> Result<(), SinkError> {
        db::upsert_raw_message(&self.pool, raw).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SinkHealth {
    pub name: &'static str,
    pub active: bool,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

impl SinkHealth {
    /// Active and not currently erroring (a success clears the last error).
    pub fn is_healthy(&self) -> bool {
        self.active && self.last_error.is_none()
    }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

pub struct MultiSink {
    sinks: Vec<Box<dyn CallSink>>,
    health: Vec<SinkHealth>,
}

impl MultiSink {
    pub fn new(primary: Box<dyn CallSink>, secondaries: Vec<Box<dyn CallSink>>) -> Self {
        let mut sinks = vec![primary];
        sinks.extend(secondaries);

        let health = sinks
            .iter()
            .map(|s| SinkHealth {
                name: s.name(),
                active: true,
                successes: 0,
                failures: 0,
                last_error: None,
            })
            .collect();

        let names: Vec<_> = sinks.iter().map(|s| s.name()).collect();
        info!("storage coordinator ready with backends: {}", names.join(" + "));

        MultiSink { sinks, health }
    }

    /// Mirror `record` to every sink. Succeeds when at least one accepted it.
    pub async fn append(&mut self, record: &CallRecord) -> Result<(), SinkError> {
        let mut wrote = 0usize;
        let mut errors: Vec<String> = Vec::new();

        for (i, sink) in self.sinks.iter_mut().enumerate() {
            match sink.append_call(record).await {
                Ok(()) => {
                    self.health[i].successes += 1;
                    self.health[i].last_error = None;
                    wrote += 1;
                    debug!("record {} stored to {}", record.message_id, self.health[i].name);
                }
                Err(e) => {
                    self.health[i].failures += 1;
                    self.health[i].last_error = Some(e.to_string());
                    // The primary failing is loud; a mirror failing is routine.
                    if i == 0 {
                        error!("{} append failed: {e}", self.health[i].name);
                    } else {
                        warn!("{} append failed: {e}", self.health[i].name);
                    }
                    errors.push(format!("{}: {e}", self.health[i].name));
                }
            }
        }

        if wrote == 0 {
            return Err(SinkError::AllFailed(errors.join("; ")));
        }

        info!(
            "call {} ({}) stored to {wrote}/{} backends",
            record.message_id,
            record.token_name.as_deref().unwrap_or("unknown"),
            self.sinks.len()
        );
        Ok(())
    }

    /// Capture a raw message. Routed to the primary only.
    pub async fn append_raw(&mut self, raw: &RawMessageRow) -> Result<(), SinkError> {
        match self.sinks[0].append_raw(raw).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.health[0].failures += 1;
                self.health[0].last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Close every sink, collecting errors. Cleanup completes for all sinks
    /// regardless of individual failures.
    pub async fn close(&mut self) {
        for (i, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.close().await {
                error!("error closing {}: {e}", self.health[i].name);
                self.health[i].last_error = Some(e.to_string());
            }
            self.health[i].active = false;
        }
        info!("all storage backends closed");
    }

    pub fn status(&self) -> &[SinkHealth] {
        &self.health
    }

    pub fn healthy_count(&self) -> usize {
        self.health.iter().filter(|h| h.is_healthy()).count()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

// ─── Test support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Shared observable state of a [`MockSink`].
    #[derive(Default)]
    pub(crate) struct MockState {
        pub appended: Vec<CallRecord>,
        pub raw_appended: Vec<RawMessageRow>,
        pub closed: bool,
        /// Scripted failures consumed per `append_call`; empty = succeed.
        pub fail_script: VecDeque<bool>,
        pub fail_always: bool,
        pub fail_close: bool,
    }

    pub(crate) struct MockSink {
        pub name: &'static str,
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockSink {
        pub(crate) fn new(name: &'static str) -> (Self, Arc<Mutex<MockState>>) {
            let state = Arc::new(Mutex::new(MockState::default()));
            (MockSink { name, state: state.clone() }, state)
        }

        pub(crate) fn failing(name: &'static str) -> (Self, Arc<Mutex<MockState>>) {
            let (sink, state) = Self::new(name);
            state.lock().unwrap().fail_always = true;
            (sink, state)
        }
    }

    #[async_trait]
    impl CallSink for MockSink {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn append_call(&mut self, record: &CallRecord) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            let fail = state.fail_always || state.fail_script.pop_front().unwrap_or(false);
            if fail {
                return Err(SinkError::Io(format!("{} scripted failure", self.name)));
            }
            state.appended.push(record.clone());
            Ok(())
        }

        async fn append_raw(&mut self, raw: &RawMessageRow) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_always {
                return Err(SinkError::Io(format!("{} scripted failure", self.name)));
            }
            state.raw_appended.push(raw.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            if state.fail_close {
                return Err(SinkError::Io(format!("{} close failure", self.name)));
            }
            Ok(())
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::MockSink;
    use super::*;
    use crate::db::tests::{discovery_record, raw};

    #[tokio::test]
    async fn append_survives_a_failing_secondary() {
        let (primary, p_state) = MockSink::new("sqlite");
        let (good, g_state) = MockSink::new("excel");
        let (bad, _b_state) = MockSink::failing("sheets");

        let mut multi = MultiSink::new(Box::new(primary), vec![Box::new(good), Box::new(bad)]);

        let rec = discovery_record(1001, "TOK", "2026-08-01T10:00:00+00:00");
        multi.append(&rec).await.unwrap();

        assert_eq!(p_state.lock().unwrap().appended.len(), 1);
        assert_eq!(g_state.lock().unwrap().appended.len(), 1);

        // Two of three healthy; the failing one reports its error.
        assert_eq!(multi.healthy_count(), 2);
        let status = multi.status();
        assert_eq!(status[2].name, "sheets");
        assert_eq!(status[2].failures, 1);
        assert!(status[2].last_error.is_some());
    }

    #[tokio::test]
    async fn append_raises_only_when_every_sink_fails() {
        let (primary, _p) = MockSink::failing("sqlite");
        let (secondary, _s) = MockSink::failing("excel");
        let mut multi = MultiSink::new(Box::new(primary), vec![Box::new(secondary)]);

        let rec = discovery_record(1001, "TOK", "2026-08-01T10:00:00+00:00");
        let err = multi.append(&rec).await.unwrap_err();
        assert!(matches!(err, SinkError::AllFailed(_)));
        assert_eq!(multi.healthy_count(), 0);
    }

    #[tokio::test]
    async fn primary_failure_alone_still_succeeds() {
        let (primary, p_state) = MockSink::failing("sqlite");
        let (secondary, s_state) = MockSink::new("excel");
        let mut multi = MultiSink::new(Box::new(primary), vec![Box::new(secondary)]);

        let rec = discovery_record(1001, "TOK", "2026-08-01T10:00:00+00:00");
        multi.append(&rec).await.unwrap();

        assert_eq!(p_state.lock().unwrap().appended.len(), 0);
        assert_eq!(s_state.lock().unwrap().appended.len(), 1);
        assert_eq!(multi.status()[0].failures, 1);
    }

    #[tokio::test]
    async fn raw_messages_go_to_the_primary_only() {
        let (primary, p_state) = MockSink::new("sqlite");
        let (secondary, s_state) = MockSink::new("excel");
        let mut multi = MultiSink::new(Box::new(primary), vec![Box::new(secondary)]);

        let row = raw(-1, 7, "text", "2026-08-01T10:00:00+00:00");
        multi.append_raw(&row).await.unwrap();

        assert_eq!(p_state.lock().unwrap().raw_appended.len(), 1);
        assert_eq!(s_state.lock().unwrap().raw_appended.len(), 0);
    }

    #[tokio::test]
    async fn close_reaches_every_sink_despite_failures() {
        let (primary, p_state) = MockSink::new("sqlite");
        let (middle, m_state) = MockSink::new("excel");
        m_state.lock().unwrap().fail_close = true;
        let (last, l_state) = MockSink::new("sheets");

        let mut multi = MultiSink::new(Box::new(primary), vec![Box::new(middle), Box::new(last)]);
        multi.close().await;

        assert!(p_state.lock().unwrap().closed);
        assert!(m_state.lock().unwrap().closed);
        assert!(l_state.lock().unwrap().closed);
        assert!(multi.status().iter().all(|h| !h.active));
    }

    #[tokio::test]
    async fn sqlite_sink_round_trips_through_the_store() {
        let pool = crate::db::tests::test_pool().await;
        let mut sink = SqliteSink::new(pool.clone());

        let row = raw(-1, 9, "text", "2026-08-01T10:00:00+00:00");
        sink.append_raw(&row).await.unwrap();

        let rec = discovery_record(9, "TOK", "2026-08-01T10:00:00+00:00");
        sink.append_call(&rec).await.unwrap();

        eprintln!("pool size={} idle={}", pool.size(), pool.num_idle());
        let stored = db::find_call_by_message_id(&pool, "Pumpfun Ultimate Alert", 9)
            .await
            .unwrap();
        assert!(stored.is_some());
        assert!(db::calls_without_raw(&pool).await.unwrap().is_empty());
    }
}
