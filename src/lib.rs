//! callfeed — real-time ingestion and enrichment of crypto "call" messages.
//!
//! A long-lived Telegram stream delivers discovery and price-update messages
//! from monitored channels. Every message is captured raw before any
//! interpretation, then classified, parsed, linked to its originating
//! discovery, and mirrored to SQLite (the source of truth) plus optional
//! xlsx and Google Sheets sinks with independent failure domains.

pub mod backfill;
pub mod db;
pub mod enrich;
pub mod excel;
pub mod linker;
pub mod listener;
pub mod parser;
pub mod retry;
pub mod settings;
pub mod sheets;
pub mod sinks;
pub mod telegram;

pub use db::{CallRecord, CryptoCallRow, RawMessageRow};
pub use listener::{ChannelConfig, MessageHandler, StreamEvent};
pub use parser::{looks_like_call, parse_call, MessageType, ParsedCall};
pub use settings::Settings;
pub use sinks::{CallSink, MultiSink, SqliteSink};
pub use telegram::{StreamSource, Supervisor, TelegramStream};
