//! Terminal configuration.
//!
//! Assembled from `POS_*` environment variables with defaults. The remote
//! backend can be given either as URL + key or as a single connection string
//! (JSON, or URL-safe base64 of that JSON, carrying `url` and `key`).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::error::{PosError, Result};

pub const ENV_DB_PATH: &str = "POS_DB_PATH";
pub const ENV_TERMINAL_ID: &str = "POS_TERMINAL_ID";
pub const ENV_SYNC_INTERVAL_SECS: &str = "POS_SYNC_INTERVAL_SECS";
pub const ENV_PROBE_INTERVAL_SECS: &str = "POS_PROBE_INTERVAL_SECS";
pub const ENV_LOG_DIR: &str = "POS_LOG_DIR";
pub const ENV_LOG_JSON: &str = "POS_LOG_JSON";
pub const ENV_REMOTE_URL: &str = "POS_REMOTE_URL";
pub const ENV_REMOTE_KEY: &str = "POS_REMOTE_KEY";
pub const ENV_CONNECTION_STRING: &str = "POS_CONNECTION_STRING";

const DEFAULT_DB_PATH: &str = "boutique_pos.db";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Backend location and API key. The key is wiped from memory on drop.
#[derive(Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: Zeroizing<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(url: &str, api_key: &str) -> Result<Self> {
        let url = normalize_remote_url(url);
        if url.is_empty() {
            return Err(PosError::Config("remote URL is empty".into()));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(PosError::Config("remote API key is empty".into()));
        }
        Ok(Self {
            url,
            api_key: Zeroizing::new(api_key.to_string()),
        })
    }

    pub fn from_connection_string(raw: &str) -> Result<Self> {
        let payload = decode_connection_string_payload(raw)
            .ok_or_else(|| PosError::Config("connection string is not valid JSON or base64".into()))?;
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let url = field("url").ok_or_else(|| PosError::Config("connection string has no url".into()))?;
        let key = Zeroizing::new(
            field("key").ok_or_else(|| PosError::Config("connection string has no key".into()))?,
        );
        Self::new(&url, &key)
    }

    /// PostgREST base, e.g. `https://x.supabase.co/rest/v1`.
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url)
    }

    /// Realtime websocket endpoint for the same project.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.api_key.as_str()
        )
    }
}

// ---------------------------------------------------------------------------
// Logging / terminal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoggingConfig {
    /// Directory for the daily rolling log file. Console only when `None`.
    pub dir: Option<PathBuf>,
    pub json: bool,
    /// Overrides `RUST_LOG` and the built-in default filter.
    pub filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PosConfig {
    pub db_path: PathBuf,
    /// Generated and kept in the local store when not configured.
    pub terminal_id: Option<String>,
    pub sync_interval: Duration,
    pub probe_interval: Duration,
    pub logging: LoggingConfig,
    pub remote: Option<RemoteConfig>,
}

impl Default for PosConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            terminal_id: None,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            logging: LoggingConfig::default(),
            remote: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    match env_var(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(PosError::Config(format!(
                "{name} must be a positive number of seconds, got '{raw}'"
            ))),
        },
    }
}

fn env_flag(name: &str) -> bool {
    env_var(name).is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl PosConfig {
    pub fn from_env() -> Result<Self> {
        let remote = match env_var(ENV_CONNECTION_STRING) {
            Some(raw) => Some(RemoteConfig::from_connection_string(&raw)?),
            None => match (env_var(ENV_REMOTE_URL), env_var(ENV_REMOTE_KEY)) {
                (Some(url), Some(key)) => Some(RemoteConfig::new(&url, &key)?),
                (None, None) => None,
                _ => {
                    return Err(PosError::Config(format!(
                        "{ENV_REMOTE_URL} and {ENV_REMOTE_KEY} must be set together"
                    )))
                }
            },
        };

        Ok(Self {
            db_path: env_var(ENV_DB_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            terminal_id: env_var(ENV_TERMINAL_ID),
            sync_interval: env_secs(ENV_SYNC_INTERVAL_SECS, DEFAULT_SYNC_INTERVAL_SECS)?,
            probe_interval: env_secs(ENV_PROBE_INTERVAL_SECS, DEFAULT_PROBE_INTERVAL_SECS)?,
            logging: LoggingConfig {
                dir: env_var(ENV_LOG_DIR).map(PathBuf::from),
                json: env_flag(ENV_LOG_JSON),
                filter: None,
            },
            remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serial_test::serial;

    const ALL_VARS: [&str; 9] = [
        ENV_DB_PATH,
        ENV_TERMINAL_ID,
        ENV_SYNC_INTERVAL_SECS,
        ENV_PROBE_INTERVAL_SECS,
        ENV_LOG_DIR,
        ENV_LOG_JSON,
        ENV_REMOTE_URL,
        ENV_REMOTE_KEY,
        ENV_CONNECTION_STRING,
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_normalize_remote_url() {
        assert_eq!(normalize_remote_url("abc.supabase.co/"), "https://abc.supabase.co");
        assert_eq!(normalize_remote_url("localhost:54321"), "http://localhost:54321");
        assert_eq!(
            normalize_remote_url("https://abc.supabase.co/rest/v1/"),
            "https://abc.supabase.co"
        );
        assert_eq!(normalize_remote_url("  "), "");
    }

    #[test]
    fn test_connection_string_json_and_base64() {
        let json = r#"{"url":"abc.supabase.co","key":"anon-key-123"}"#;
        let from_json = RemoteConfig::from_connection_string(json).unwrap();
        assert_eq!(from_json.url, "https://abc.supabase.co");
        assert_eq!(from_json.api_key.as_str(), "anon-key-123");

        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        let from_b64 = RemoteConfig::from_connection_string(&encoded).unwrap();
        assert_eq!(from_b64.url, from_json.url);
        assert_eq!(from_b64.api_key.as_str(), "anon-key-123");

        assert!(RemoteConfig::from_connection_string("short").is_err());
        assert!(RemoteConfig::from_connection_string(r#"{"url":"x.co"}"#).is_err());
    }

    #[test]
    fn test_debug_redacts_key_and_urls_derive() {
        let cfg = RemoteConfig::new("https://abc.supabase.co", "secret").unwrap();
        assert!(!format!("{cfg:?}").contains("secret"));
        assert_eq!(cfg.rest_url(), "https://abc.supabase.co/rest/v1");
        assert_eq!(
            cfg.realtime_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=secret&vsn=1.0.0"
        );
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let cfg = PosConfig::from_env().unwrap();
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(cfg.terminal_id, None);
        assert_eq!(cfg.sync_interval, Duration::from_secs(30));
        assert!(cfg.remote.is_none());
        assert!(!cfg.logging.json);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var(ENV_TERMINAL_ID, "till-4");
        std::env::set_var(ENV_SYNC_INTERVAL_SECS, "90");
        std::env::set_var(ENV_LOG_JSON, "true");
        std::env::set_var(ENV_REMOTE_URL, "abc.supabase.co");
        std::env::set_var(ENV_REMOTE_KEY, "k");
        let cfg = PosConfig::from_env().unwrap();
        clear_env();

        assert_eq!(cfg.terminal_id.as_deref(), Some("till-4"));
        assert_eq!(cfg.sync_interval, Duration::from_secs(90));
        assert!(cfg.logging.json);
        assert_eq!(cfg.remote.unwrap().url, "https://abc.supabase.co");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        std::env::set_var(ENV_SYNC_INTERVAL_SECS, "soon");
        assert!(matches!(PosConfig::from_env(), Err(PosError::Config(_))));
        clear_env();

        std::env::set_var(ENV_REMOTE_URL, "abc.supabase.co");
        assert!(matches!(PosConfig::from_env(), Err(PosError::Config(_))));
        clear_env();
    }
}
