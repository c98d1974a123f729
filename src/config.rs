//! Configuration types.
//!
//! Everything is read from the environment, optionally seeded from a `.env`
//! file. Unset variables fall back to defaults; set but unparseable values
//! are rejected.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::ingest::poller::AttachmentPolicy;

/// Gmail API credentials and inbox settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// Inbox address; candidates are listed with `to:<address>`.
    pub address: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
    /// Upper bound on candidates listed per tick.
    pub max_results: u32,
}

impl GmailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        Ok(Self {
            address: required("GMAIL_ADDRESS")?,
            client_id: required("GMAIL_CLIENT_ID")?,
            client_secret: SecretString::from(required("GMAIL_CLIENT_SECRET")?),
            refresh_token: SecretString::from(required("GMAIL_REFRESH_TOKEN")?),
            max_results: parse_or(&lookup, "GMAIL_MAX_RESULTS", 10)?,
        })
    }
}

/// Process-wide settings.
#[derive(Debug)]
pub struct PipelineConfig {
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// Ingestion tick period.
    pub poll_interval: Duration,
    /// Processing tick period.
    pub process_tick: Duration,
    /// Delay between streamed chunks of the narrative analyzer.
    pub stream_chunk: Duration,
    /// A run longer than this is force-failed.
    pub max_processing: Duration,
    pub attachment_policy: AttachmentPolicy,
    pub uploads_dir: PathBuf,
    /// `Err` when ingestion credentials are incomplete; ingestion is then
    /// disabled but everything else runs.
    pub gmail: Result<GmailConfig, ConfigError>,
    /// Directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_or(&lookup, "PORT", 3001)?,
            poll_interval: Duration::from_secs(positive(&lookup, "POLL_INTERVAL", 30)?),
            process_tick: Duration::from_secs(positive(&lookup, "PROCESS_TICK_SECS", 5)?),
            stream_chunk: Duration::from_millis(parse_or(&lookup, "STREAM_CHUNK_MS", 200)?),
            max_processing: Duration::from_secs(positive(&lookup, "MAX_PROCESSING_SECS", 120)?),
            attachment_policy: parse_or(&lookup, "ATTACHMENT_POLICY", AttachmentPolicy::default())?,
            uploads_dir: lookup("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./uploads")),
            gmail: GmailConfig::from_lookup(&lookup),
            log_dir: lookup("INTAKE_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

/// Seed the process environment from an env file.
///
/// With no path, `.env` is searched for from the current directory upward.
/// Variables already set win. A missing file is not an error; `Ok(false)`
/// reports that nothing was loaded.
pub fn load_env_file(path: Option<&Path>) -> Result<bool, ConfigError> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|_| true),
        None => dotenvy::dotenv().map(|_| true),
    };

    match loaded {
        Ok(loaded) => Ok(loaded),
        Err(dotenvy::Error::Io(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// A tick period in whole seconds; zero is rejected.
fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
