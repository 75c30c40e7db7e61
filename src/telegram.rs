//! Stream supervisor and the Telegram transport.
//!
//! The supervisor owns the event loop: it keeps a long-lived authenticated
//! stream alive, reconnects with exponential backoff on transport errors,
//! honors flood-wait durations verbatim, health-checks the connection every
//! five minutes, and drains in-flight work on shutdown. Reliability logic is
//! generic over [`StreamSource`] so it is exercised against a scripted source
//! in tests; [`TelegramStream`] is the grammers-backed production source.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use grammers_client::types::Chat;
use grammers_client::{Client, Config, InitParams, InvocationError, Update};
use grammers_session::Session;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::listener::{MessageHandler, StreamEvent};
use crate::retry::Backoff;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StreamError {
    /// Operator concern — never retried.
    #[error("not authorized: {0}")]
    Unauthorized(String),
    /// Flow control from the source; wait exactly this long.
    #[error("flood wait: {0}s")]
    FloodWait(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream closed")]
    Closed,
}

// ─── Stream source ───────────────────────────────────────────────────────────

/// A long-lived, authenticated event stream.
#[async_trait]
pub trait StreamSource: Send {
    async fn connect(&mut self) -> Result<(), StreamError>;

    /// The next message event. Cancellation-safe: an event interrupted before
    /// delivery is redelivered after reconnect.
    async fn next_event(&mut self) -> Result<StreamEvent, StreamError>;

    /// Cheap liveness probe for the periodic health check.
    async fn check_alive(&mut self) -> bool;

    async fn disconnect(&mut self);
}

// ─── Telegram transport ──────────────────────────────────────────────────────

pub struct TelegramStream {
    api_id: i32,
    api_hash: String,
    session_path: PathBuf,
    client: Option<Client>,
}

impl TelegramStream {
    pub fn new(api_id: i32, api_hash: &str, session_path: PathBuf) -> Self {
        TelegramStream {
            api_id,
            api_hash: api_hash.to_string(),
            session_path,
            client: None,
        }
    }
}

#[async_trait]
impl StreamSource for TelegramStream {
    async fn connect(&mut self) -> Result<(), StreamError> {
        let session = Session::load_file_or_create(&self.session_path)
            .map_err(|e| StreamError::Transport(format!("session file: {e}")))?;

        let client = Client::connect(Config {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            // catch_up replays messages missed across reconnects.
            params: InitParams { catch_up: true, ..Default::default() },
        })
        .await
        .map_err(|e| StreamError::Transport(e.to_string()))?;

        if !client.is_authorized().await.map_err(map_invocation)? {
            return Err(StreamError::Unauthorized(
                "session is not authorized; run the interactive authentication first".to_string(),
            ));
        }

        if let Err(e) = client.session().save_to_file(&self.session_path) {
            warn!("could not save session file: {e}");
        }

        info!("connected to telegram");
        self.client = Some(client);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<StreamEvent, StreamError> {
        let client = self.client.as_ref().ok_or(StreamError::Closed)?;
        loop {
            let update = client.next_update().await.map_err(map_invocation)?;
            let Update::NewMessage(message) = update else { continue };
            if message.outgoing() {
                continue;
            }

            let chat = message.chat();
            return Ok(StreamEvent {
                channel_id: marked_chat_id(&chat),
                message_id: message.id() as i64,
                text: message.text().to_string(),
                date: message.date(),
                reply_to_message_id: message.reply_to_message_id().map(|id| id as i64),
            });
        }
    }

    async fn check_alive(&mut self) -> bool {
        match &self.client {
            Some(client) => client.is_authorized().await.unwrap_or(false),
            None => false,
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.session().save_to_file(&self.session_path) {
                warn!("could not save session file on disconnect: {e}");
            }
            drop(client);
            info!("disconnected from telegram");
        }
    }
}

fn map_invocation(err: InvocationError) -> StreamError {
    match &err {
        InvocationError::Rpc(rpc) if rpc.name.starts_with("FLOOD_WAIT") => {
            StreamError::FloodWait(u64::from(rpc.value.unwrap_or(1)))
        }
        InvocationError::Rpc(rpc) if rpc.code == 401 => StreamError::Unauthorized(rpc.name.clone()),
        _ => StreamError::Transport(err.to_string()),
    }
}

/// Bot-API style marked ids: channels get the `-100…` prefix, small groups a
/// plain minus. Keeps configuration in the "channels are negative" convention.
fn marked_chat_id(chat: &Chat) -> i64 {
    match chat {
        Chat::User(_) => chat.id(),
        Chat::Group(_) => -chat.id(),
        Chat::Channel(_) => -1_000_000_000_000 - chat.id(),
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct Supervisor<S: StreamSource> {
    source: S,
    handler: MessageHandler,
    reconnect: Backoff,
    health_interval: Duration,
    drain_timeout: Duration,
    pending: VecDeque<StreamEvent>,
}

impl<S: StreamSource> Supervisor<S> {
    pub fn new(source: S, handler: MessageHandler) -> Self {
        Supervisor {
            source,
            handler,
            reconnect: Backoff::new(5, Duration::from_secs(1), Duration::from_secs(60)),
            health_interval: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            pending: VecDeque::new(),
        }
    }

    pub fn handler_mut(&mut self) -> &mut MessageHandler {
        &mut self.handler
    }

    pub fn into_handler(self) -> MessageHandler {
        self.handler
    }

    /// Run until the shutdown signal flips, the stream reports closed, or an
    /// unrecoverable error occurs. Per-event failures never terminate the
    /// loop.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamError> {
        self.connect_with_policy().await?;

        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + self.health_interval,
            self.health_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            info!("shutdown requested");
                            break;
                        }
                        Ok(()) => {}
                        // Sender gone: nobody can ask us to stop, so stop.
                        Err(_) => break,
                    }
                }
                _ = health.tick() => {
                    if self.source.check_alive().await {
                        let (healthy, total) = self.handler.sink_health();
                        info!("health check ok; {healthy}/{total} sinks healthy");
                    } else {
                        warn!("health check failed; forcing reconnect");
                        self.connect_with_policy().await?;
                    }
                }
                event = self.source.next_event() => match event {
                    Ok(ev) => {
                        self.pending.push_back(ev);
                        self.process_pending().await;
                    }
                    Err(StreamError::Unauthorized(msg)) => {
                        error!("authorization lost: {msg}");
                        self.drain().await;
                        self.source.disconnect().await;
                        return Err(StreamError::Unauthorized(msg));
                    }
                    Err(StreamError::FloodWait(secs)) => {
                        warn!("flood wait while listening: sleeping {secs}s as instructed");
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    }
                    Err(StreamError::Closed) => {
                        info!("stream closed");
                        break;
                    }
                    Err(StreamError::Transport(msg)) => {
                        warn!("transport error while listening: {msg}");
                        self.connect_with_policy().await?;
                    }
                }
            }
        }

        self.drain().await;
        self.source.disconnect().await;
        Ok(())
    }

    /// Connect, retrying transport failures up to the attempt cap with
    /// exponential backoff. Authorization failures abort immediately;
    /// flood waits are honored verbatim.
    async fn connect_with_policy(&mut self) -> Result<(), StreamError> {
        let max = self.reconnect.max_attempts;
        for attempt in 1..=max {
            match self.source.connect().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!("reconnected on attempt {attempt}");
                    }
                    return Ok(());
                }
                Err(StreamError::Unauthorized(msg)) => {
                    error!("authorization failed; not retrying: {msg}");
                    return Err(StreamError::Unauthorized(msg));
                }
                Err(StreamError::FloodWait(secs)) => {
                    warn!("flood wait during connect: sleeping {secs}s as instructed");
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
                Err(e) if attempt == max => {
                    error!("connect failed after {max} attempts: {e}");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.reconnect.delay_for(attempt);
                    warn!(
                        "connect attempt {attempt}/{max} failed ({e}); retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(StreamError::Transport("reconnect attempts exhausted".to_string()))
    }

    async fn process_pending(&mut self) {
        while let Some(ev) = self.pending.pop_front() {
            if let Err(e) = self.handler.handle_event(&ev).await {
                error!("event {} abandoned: {e}", ev.message_id);
            }
        }
    }

    /// Finish already-accepted events within the drain timeout; anything left
    /// is abandoned (its raw capture, if persisted, remains for backfill).
    async fn drain(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        info!("draining {} pending events", self.pending.len());

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(ev) = self.pending.pop_front() {
                if let Err(e) = self.handler.handle_event(&ev).await {
                    error!("event {} abandoned during drain: {e}", ev.message_id);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("drain timed out; abandoning {} events", self.pending.len());
        } else {
            debug!("drain complete");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
