//! Process configuration, bound once at startup from the environment.
//!
//! Every recognized variable is read exactly once into an immutable
//! [`Settings`] value that gets passed into constructors; nothing else in the
//! crate touches the environment.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};
use thiserror::Error;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("SHEET_ID is set but GOOGLE_CREDENTIALS_PATH is not")]
    CredentialsRequired,
    #[error("session file error: {0}")]
    Session(String),
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Typed application configuration.
///
/// Keys are case-sensitive. `API_ID` and `API_HASH` are required; everything
/// else has a default or is optional.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_id: i32,
    pub api_hash: String,
    /// Session artifact base name; the file lives at `data/{name}.session`.
    pub tg_session: String,
    /// Base64-encoded session blob for deployments without persistent storage.
    pub session_b64: Option<String>,

    pub enable_excel: bool,
    pub excel_path: Option<PathBuf>,

    pub enable_sheets: bool,
    pub sheet_id: Option<String>,
    pub credentials_path: Option<PathBuf>,
}

impl Settings {
    /// Bind settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Bind settings from an arbitrary lookup function (used by tests).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let api_id_raw = get("API_ID").ok_or(SettingsError::Missing("API_ID"))?;
        let api_id = api_id_raw
            .trim()
            .parse::<i32>()
            .map_err(|e| SettingsError::Invalid { key: "API_ID", reason: e.to_string() })?;
        let api_hash = get("API_HASH").ok_or(SettingsError::Missing("API_HASH"))?;

        let settings = Settings {
            api_id,
            api_hash,
            tg_session: get("TG_SESSION").unwrap_or_else(|| "pf_session".to_string()),
            session_b64: get("TG_SESSION_B64"),
            enable_excel: parse_bool("ENABLE_EXCEL", get("ENABLE_EXCEL"))?,
            excel_path: get("EXCEL_PATH").map(PathBuf::from),
            enable_sheets: parse_bool("ENABLE_SHEETS", get("ENABLE_SHEETS"))?,
            sheet_id: get("SHEET_ID"),
            credentials_path: get("GOOGLE_CREDENTIALS_PATH").map(PathBuf::from),
        };

        // The Sheets sink cannot authenticate without service-account
        // credentials, so reject the combination up front.
        if settings.sheet_id.is_some() && settings.credentials_path.is_none() {
            return Err(SettingsError::CredentialsRequired);
        }

        Ok(settings)
    }

    /// Resolve the session file path, materializing it from the base64 blob
    /// when the file does not exist yet.
    pub fn session_path(&self) -> Result<PathBuf, SettingsError> {
        materialize_session_in(Path::new("data"), &self.tg_session, self.session_b64.as_deref())
    }
}

fn parse_bool(key: &'static str, value: Option<String>) -> Result<bool, SettingsError> {
    let Some(value) = value else { return Ok(false) };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(SettingsError::Invalid { key, reason: format!("not a boolean: {other}") }),
    }
}

// ─── Session file ────────────────────────────────────────────────────────────

/// Ensure `{dir}/{name}.session` exists, decoding the supplied base64 blob
/// into it when missing.
///
/// A missing file with no blob is not an error — the transport will create a
/// fresh (unauthorized) session, and the supervisor turns that into a clean
/// auth failure for the operator to resolve.
pub fn materialize_session_in(
    dir: &Path,
    name: &str,
    blob_b64: Option<&str>,
) -> Result<PathBuf, SettingsError> {
    let session_path = dir.join(format!("{name}.session"));

    if session_path.exists() {
        info!("session file found: {}", session_path.display());
        return Ok(session_path);
    }

    let Some(blob_b64) = blob_b64 else {
        warn!(
            "no session file at {} and TG_SESSION_B64 not set; starting unauthenticated",
            session_path.display()
        );
        return Ok(session_path);
    };

    std::fs::create_dir_all(dir)
        .map_err(|e| SettingsError::Session(format!("create {}: {e}", dir.display())))?;

    let bytes = BASE64
        .decode(blob_b64.trim())
        .map_err(|e| SettingsError::Session(format!("invalid TG_SESSION_B64: {e}")))?;
    std::fs::write(&session_path, bytes)
        .map_err(|e| SettingsError::Session(format!("write {}: {e}", session_path.display())))?;

    info!("session file created from environment: {}", session_path.display());
    Ok(session_path)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
