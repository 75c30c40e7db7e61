//! Backfill CLI — re-parse captured messages that produced no call.
//!
//! Log records go to `logs/backfill.log`; operator-facing progress stays on
//! stdout. Exits 0 on success, 1 on fatal error.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use callfeed::backfill::{self, BackfillOptions};
use callfeed::db;

const DB_CANDIDATES: [&str; 4] = [
    "crypto_calls_production.db",
    "test_crypto_calls.db",
    "crypto_calls.db",
    "message_analysis.db",
];
const LOG_PATH: &str = "logs/backfill.log";

#[derive(Parser, Debug)]
#[command(name = "backfill", about = "Re-parse unprocessed raw messages and link them to discoveries")]
struct Args {
    /// Only process messages newer than this many hours.
    #[arg(long = "since-hours", default_value_t = 24)]
    since_hours: i64,

    /// Messages per batch.
    #[arg(long, default_value_t = 500)]
    batch: i64,

    /// Stop after processing this many messages (0 = no limit).
    #[arg(long, default_value_t = 0)]
    limit: i64,

    /// Parse and link but don't write to the database.
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging.
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    std::fs::create_dir_all("logs").context("creating logs directory")?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_PATH)
        .with_context(|| format!("opening {LOG_PATH}"))?;

    env_logger::Builder::new()
        .filter_level(if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let Some(db_path) = DB_CANDIDATES.iter().map(Path::new).find(|p| p.exists()) else {
        eprintln!("no database found; run the monitor first to collect data");
        bail!("no database found");
    };

    info!(
        "backfill starting: db={} since={}h batch={} limit={} dry_run={}",
        db_path.display(),
        args.since_hours,
        args.batch,
        args.limit,
        args.dry_run
    );
    println!("backfill: {} (since {}h)", db_path.display(), args.since_hours);
    if args.dry_run {
        println!("dry run: no database writes will occur");
    }

    let pool = db::open(db_path).await.context("opening primary store")?;
    let opts = BackfillOptions {
        since_hours: args.since_hours,
        batch_size: args.batch,
        limit: args.limit,
        dry_run: args.dry_run,
    };

    let stats = backfill::run(&pool, &opts).await.context("backfill failed")?;

    println!("backfill complete");
    println!("  processed:           {}", stats.processed);
    println!("  parsed:              {}", stats.parsed);
    println!("  inserted:            {}", stats.inserted);
    println!("  linked by reply:     {}", stats.linked_by_reply);
    println!("  linked by heuristic: {}", stats.linked_by_heuristic);
    println!("  skipped:             {}", stats.skipped);
    println!("  errors:              {}", stats.errors);
    if stats.processed > 0 {
        let rate = stats.parsed as f64 / stats.processed as f64 * 100.0;
        println!("  parse success rate:  {rate:.1}%");
    }
    if args.dry_run {
        println!("this was a dry run; rerun without --dry-run to apply");
    }
    println!("detailed logs: {LOG_PATH}");

    info!("backfill finished: {stats:?}");
    Ok(())
}
