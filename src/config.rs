//! Runtime configuration, read from the environment (and `.env`)

use crate::sync::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_REPLAY_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DB_FILE_NAME: &str = "notes.db";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Cannot determine a data directory; set NOTES_DB_PATH")]
    NoDataDir,
}

/// Signed-in user handed over by the host app
#[derive(Clone)]
pub struct InitialSession {
    pub user_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for InitialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitialSession")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend_url: Url,
    pub api_key: String,
    pub session: Option<InitialSession>,
    pub db_path: PathBuf,
    pub replay_interval_minutes: u64,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` uses the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let raw_url = get("NOTES_BACKEND_URL").ok_or(ConfigError::Missing("NOTES_BACKEND_URL"))?;
        let backend_url = Url::parse(raw_url.trim()).map_err(|e| ConfigError::Invalid {
            name: "NOTES_BACKEND_URL",
            value: raw_url.clone(),
            reason: e.to_string(),
        })?;

        let api_key = get("NOTES_API_KEY").unwrap_or_default();

        let session = match (get("NOTES_USER_ID"), get("NOTES_ACCESS_TOKEN")) {
            (Some(user_id), Some(access_token)) => Some(InitialSession { user_id, access_token }),
            _ => None,
        };

        let db_path = match get("NOTES_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let replay_interval_minutes = parse_number(
            "NOTES_REPLAY_INTERVAL_MINUTES",
            get("NOTES_REPLAY_INTERVAL_MINUTES"),
            DEFAULT_REPLAY_INTERVAL_MINUTES,
        )?;
        if !(1..=1440).contains(&replay_interval_minutes) {
            return Err(ConfigError::Invalid {
                name: "NOTES_REPLAY_INTERVAL_MINUTES",
                value: replay_interval_minutes.to_string(),
                reason: "must be 1-1440".to_string(),
            });
        }

        let probe_secs = parse_number(
            "NOTES_PROBE_INTERVAL_SECS",
            get("NOTES_PROBE_INTERVAL_SECS"),
            DEFAULT_PROBE_INTERVAL_SECS,
        )?;
        let timeout_secs = parse_number(
            "NOTES_REQUEST_TIMEOUT_SECS",
            get("NOTES_REQUEST_TIMEOUT_SECS"),
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;

        let mut retry = RetryPolicy::default();
        if let Some(raw) = get("NOTES_FAILURE_NOTICE_AFTER") {
            retry.notice_after_attempts = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    name: "NOTES_FAILURE_NOTICE_AFTER",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(Self {
            backend_url,
            api_key,
            session,
            db_path,
            replay_interval_minutes,
            probe_interval: Duration::from_secs(probe_secs.max(1)),
            request_timeout: Duration::from_secs(timeout_secs.max(1)),
            retry,
        })
    }
}

fn parse_number(name: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
    }
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    let dirs = directories::ProjectDirs::from("com", "notes", "notes-sync").ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().join(DB_FILE_NAME))
}
