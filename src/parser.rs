//! Message classification and parsing.
//!
//! Four recognized families, tried in order: price updates (with or without a
//! VIP multiple), token discoveries, bonding lifecycle markers, and the legacy
//! `Entry/Peak` result format. Anything else is a no-match — [`parse_call`]
//! never fails, it just returns `None`.

use once_cell::sync::Lazy;
use regex::Regex;

// ─── Message type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discovery,
    Update,
    Bonding,
    Other,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Discovery => "discovery",
            MessageType::Update => "update",
            MessageType::Bonding => "bonding",
            MessageType::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "discovery" => MessageType::Discovery,
            "update" => MessageType::Update,
            "bonding" => MessageType::Bonding,
            _ => MessageType::Other,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Parsed record ───────────────────────────────────────────────────────────

/// Structured fields extracted from one message. Caps are in base units
/// (the `K`/`M`/`B` suffix already applied).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub token_name: Option<String>,
    pub entry_cap: Option<f64>,
    pub peak_cap: Option<f64>,
    pub x_gain: Option<f64>,
    pub vip_x: Option<f64>,
    pub message_type: MessageType,
    pub contract_address: Option<String>,
    pub time_to_peak: Option<String>,
}

// ─── Patterns ────────────────────────────────────────────────────────────────

/// Leading glyphs that open an update message.
const UPDATE_GLYPHS: [&str; 6] = ["🎉", "🔥", "🌕", "⚡", "🚀", "🌙"];

// Update with VIP multiple:  🔥 5.4x(6.6x from VIP) | 💹From 50.0K ↗️ 270.0K within 5d
// The `\x{FE0F}?` soaks up the emoji variation selector some clients append.
static UPDATE_VIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)[🎉🔥🌕⚡🚀🌙]\x{FE0F}?\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)x\s*\(([0-9]+(?:\.[0-9]+)?)x\s*from\s*VIP\)\*{0,2}\s*[`|]*\s*💹`*From`*\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)\s*([KMB]?)\*{0,2}\s*↗\x{FE0F}?\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)\s*([KMB]?)\*{0,2}\s*`*within`*\s*(\S+)",
    )
    .unwrap()
});

// Update without VIP:  🎉 2.6x | 💹From 45.9K ↗️ 115.0K within 8m
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)[🎉🔥🌕⚡🚀🌙]\x{FE0F}?\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)x\*{0,2}\s*[`|]*\s*💹`*From`*\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)\s*([KMB]?)\*{0,2}\s*↗\x{FE0F}?\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)\s*([KMB]?)\*{0,2}\s*`*within`*\s*(\S+)",
    )
    .unwrap()
});

// Discovery opener, markdown form:  [Bean Cabal (CABAL)](https://…)
static DISCOVERY_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[([^\]]+)\]\([^)]*\)").unwrap());

// Discovery opener, plain form at the start of the message:  Bean Cabal (CABAL)
static DISCOVERY_PLAIN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([^\[\n]{1,80}?\([^)\n]{1,30}\))").unwrap());

// Contract address: a 20+ alphanumeric run, backticked or standing alone.
static CONTRACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"`([A-Za-z0-9]{20,})`|(?:^|\s)([A-Za-z0-9]{20,})(?:\s|$)").unwrap()
});

// Market cap:  `Cap:` **45.9K**
static CAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)`?Cap:?`?\s*\*{0,2}([0-9]+(?:\.[0-9]+)?)\s*([KMB]?)").unwrap()
});

// Legacy fallback format pieces:  $TOKEN Entry: 45K MC Peak: 180K MC (4x) VIP
static FALLBACK_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]*)").unwrap());
static FALLBACK_ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Entry:?\s*([0-9]+(?:\.[0-9]+)?)\s*([KMB])?").unwrap());
static FALLBACK_PEAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Peak:?\s*([0-9]+(?:\.[0-9]+)?)\s*([KMB])?").unwrap());
static FALLBACK_GAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\(([0-9]+(?:\.[0-9]+)?)x").unwrap());

// ─── Classifier ──────────────────────────────────────────────────────────────

/// Cheap surface test deciding whether [`parse_call`] is worth invoking.
///
/// The parser is authoritative: this must never reject a message the parser
/// would accept, so every check here is at least as loose as the matching
/// parse family.
pub fn looks_like_call(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }

    let lower = text.to_lowercase();
    let has_digit = text.chars().any(|c| c.is_ascii_digit());

    let discovery_shaped = lower.contains("cap")
        && text.chars().any(|c| matches!(c, '(' | ')' | '[' | ']'))
        && has_digit;

    let result_shaped = lower.contains("entry") && lower.contains("peak");

    let update_shaped = UPDATE_GLYPHS.iter().any(|g| text.contains(g))
        && lower.contains("from")
        && text.contains('↗')
        && has_digit;

    let bonding_shaped = lower.contains("bonded");

    let has_multiplier = lower.contains('x') && has_digit;
    let has_mc = lower.contains("mc");
    let has_crypto_symbols =
        text.contains('🚀') || text.contains('⚡') || text.contains('$') || text.contains("CA:");

    discovery_shaped
        || (result_shaped && (has_multiplier || has_mc || has_crypto_symbols))
        || update_shaped
        || bonding_shaped
}

// ─── Parser ──────────────────────────────────────────────────────────────────

/// Parse a call message into structured fields, or `None` when the text
/// matches no recognized family.
pub fn parse_call(text: &str) -> Option<ParsedCall> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    parse_update(text)
        .or_else(|| parse_discovery(text))
        .or_else(|| parse_bonding(text))
        .or_else(|| parse_fallback(text))
}

fn parse_update(text: &str) -> Option<ParsedCall> {
    if let Some(caps) = UPDATE_VIP_RE.captures(text) {
        return Some(ParsedCall {
            token_name: None, // updates never name their token; the linker fills it
            entry_cap: Some(magnitude(caps[3].parse().ok()?, caps.get(4))),
            peak_cap: Some(magnitude(caps[5].parse().ok()?, caps.get(6))),
            x_gain: Some(caps[1].parse().ok()?),
            vip_x: Some(caps[2].parse().ok()?),
            message_type: MessageType::Update,
            contract_address: None,
            time_to_peak: Some(caps[7].to_string()),
        });
    }

    let caps = UPDATE_RE.captures(text)?;
    Some(ParsedCall {
        token_name: None,
        entry_cap: Some(magnitude(caps[2].parse().ok()?, caps.get(3))),
        peak_cap: Some(magnitude(caps[4].parse().ok()?, caps.get(5))),
        x_gain: Some(caps[1].parse().ok()?),
        vip_x: None,
        message_type: MessageType::Update,
        contract_address: None,
        time_to_peak: Some(caps[6].to_string()),
    })
}

fn parse_discovery(text: &str) -> Option<ParsedCall> {
    let token_name = DISCOVERY_NAME_RE
        .captures(text)
        .or_else(|| DISCOVERY_PLAIN_NAME_RE.captures(text))
        .map(|c| c[1].trim().to_string())?;

    let cap_caps = CAP_RE.captures(text)?;
    let cap = magnitude(cap_caps[1].parse().ok()?, cap_caps.get(2));

    let contract_address = CONTRACT_RE
        .captures(text)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string());

    // The discovery is the baseline: entry and peak coincide, gain is 1.0.
    Some(ParsedCall {
        token_name: Some(token_name),
        entry_cap: Some(cap),
        peak_cap: Some(cap),
        x_gain: Some(1.0),
        vip_x: None,
        message_type: MessageType::Discovery,
        contract_address,
        time_to_peak: None,
    })
}

fn parse_bonding(text: &str) -> Option<ParsedCall> {
    if !text.to_lowercase().contains("bonded") {
        return None;
    }
    Some(ParsedCall {
        token_name: None,
        entry_cap: None,
        peak_cap: None,
        x_gain: None,
        vip_x: None,
        message_type: MessageType::Bonding,
        contract_address: None,
        time_to_peak: None,
    })
}

fn parse_fallback(text: &str) -> Option<ParsedCall> {
    let entry = FALLBACK_ENTRY_RE.captures(text)?;
    let peak = FALLBACK_PEAK_RE.captures(text)?;
    let gain = FALLBACK_GAIN_RE.captures(text)?;

    let x_gain: f64 = gain[1].parse().ok()?;
    let vip_x = text.to_lowercase().contains("vip").then_some(x_gain);

    Some(ParsedCall {
        token_name: FALLBACK_TOKEN_RE
            .captures(text)
            .map(|c| c[1].to_uppercase()),
        entry_cap: Some(magnitude(entry[1].parse().ok()?, entry.get(2))),
        peak_cap: Some(magnitude(peak[1].parse().ok()?, peak.get(2))),
        x_gain: Some(x_gain),
        vip_x,
        message_type: MessageType::Update,
        contract_address: None,
        time_to_peak: None,
    })
}

/// Apply a `K`/`M`/`B` magnitude suffix; a missing suffix multiplies by 1.
fn magnitude(value: f64, unit: Option<regex::Match<'_>>) -> f64 {
    match unit.map(|m| m.as_str().to_ascii_uppercase()).as_deref() {
        Some("K") => value * 1_000.0,
        Some("M") => value * 1_000_000.0,
        Some("B") => value * 1_000_000_000.0,
        _ => value,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
