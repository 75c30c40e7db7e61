//! Live crypto-call monitor.
//!
//! Connects to Telegram, listens on the configured channels, and mirrors
//! every recognized call to the configured storage backends. Runs until
//! ctrl-c, then drains in-flight work and closes the sinks.

use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::watch;

use callfeed::db;
use callfeed::excel::ExcelSink;
use callfeed::listener::{ChannelConfig, MessageHandler};
use callfeed::settings::Settings;
use callfeed::sheets::SheetsSink;
use callfeed::sinks::{CallSink, MultiSink, SqliteSink};
use callfeed::telegram::{Supervisor, TelegramStream};

const DB_PATH: &str = "crypto_calls_production.db";

fn monitored_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        // @pfultimate
        channel_id: -1002380293749,
        channel_name: "Pumpfun Ultimate Alert".to_string(),
        is_active: true,
        rate_limit: 10,
    }]
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env().context("loading configuration")?;
    let session_path = settings.session_path().context("preparing session file")?;

    let pool = db::open(Path::new(DB_PATH)).await.context("opening primary store")?;

    // Optional mirrors degrade gracefully: a sink that fails to open is
    // skipped, the monitor keeps running on the remaining backends.
    let mut secondaries: Vec<Box<dyn CallSink>> = Vec::new();
    if settings.enable_excel {
        match settings.excel_path.clone() {
            Some(path) => match ExcelSink::open(path) {
                Ok(sink) => secondaries.push(Box::new(sink)),
                Err(e) => error!("excel sink unavailable: {e}"),
            },
            None => error!("ENABLE_EXCEL is set but EXCEL_PATH is not"),
        }
    }
    if settings.enable_sheets {
        match (settings.sheet_id.clone(), settings.credentials_path.clone()) {
            (Some(sheet_id), Some(credentials)) => match SheetsSink::open(sheet_id, &credentials) {
                Ok(sink) => secondaries.push(Box::new(sink)),
                Err(e) => error!("sheets sink unavailable: {e}"),
            },
            _ => error!("ENABLE_SHEETS is set but SHEET_ID is not"),
        }
    }

    let sinks = MultiSink::new(Box::new(SqliteSink::new(pool.clone())), secondaries);
    let handler = MessageHandler::new(monitored_channels(), pool.clone(), sinks);
    let stream = TelegramStream::new(settings.api_id, &settings.api_hash, session_path);
    let mut supervisor = Supervisor::new(stream, handler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    info!("monitoring started; stop with ctrl-c");
    let outcome = supervisor.run(shutdown_rx).await;

    let mut handler = supervisor.into_handler();
    handler.log_stats();
    let (healthy, total) = handler.sink_health();
    info!("final sink health: {healthy}/{total}");
    handler.sinks_mut().close().await;

    outcome.context("stream supervisor failed")?;
    info!("monitor stopped");
    Ok(())
}
