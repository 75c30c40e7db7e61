//! Market-data enrichment stub.
//!
//! A hook in the ingest pipeline where live price and market-cap data from
//! Dexscreener (or a fallback) would be merged into the record. Carries no
//! behavior today; the record passes through unchanged.

use log::debug;

use crate::db::CallRecord;

pub const DEX_API_BASE: &str = "https://api.dexscreener.com/latest/dex/tokens";

pub async fn enrich_with_price(record: &mut CallRecord) {
    debug!(
        "enrich_with_price pass-through for {}",
        record.token_name.as_deref().unwrap_or("unknown")
    );
}
