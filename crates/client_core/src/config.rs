use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "APP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub database_url: String,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub sync_interval_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub max_auth_chain: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub stale_in_progress_secs: u64,
    pub archive_retention_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/".into(),
            database_url: "sqlite://./data/sync.db".into(),
            user_id: None,
            access_token: None,
            refresh_token: None,
            sync_interval_secs: 15 * 60,
            max_retries: 5,
            initial_backoff_ms: 1_000,
            request_timeout_secs: 30,
            refresh_timeout_secs: 10,
            max_auth_chain: 3,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 5,
            stale_in_progress_secs: 5 * 60,
            archive_retention_days: 7,
        }
    }
}

/// Layers defaults, an optional TOML file and `APP__*` environment variables.
pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings> {
    load_settings_with_env(path, None)
}

pub fn load_settings_with_env(
    path: Option<&Path>,
    env: Option<HashMap<String, String>>,
) -> Result<SyncSettings> {
    let defaults = Config::try_from(&SyncSettings::default())
        .context("failed to serialize default settings")?;
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_SETTINGS_FILE).required(false),
    };
    let settings = Config::builder()
        .add_source(defaults)
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()
        .context("failed to load settings")?
        .try_deserialize::<SyncSettings>()
        .context("invalid settings")?;
    settings.validate()?;
    Ok(settings)
}

impl SyncSettings {
    pub fn validate(&self) -> Result<()> {
        api_base_url(&self.api_base_url)?;
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be at least 1"));
        }
        if self.sync_interval_secs == 0 {
            return Err(anyhow!("sync_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        api_base_url(&self.api_base_url)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn archive_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.archive_retention_days))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            stale_after: Duration::from_secs(self.stale_in_progress_secs),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Age after which an `IN_PROGRESS` record is assumed abandoned.
    pub stale_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SyncSettings::default().retry_policy()
    }
}

impl RetryPolicy {
    /// `initial_backoff * 2^retry_count`, uncapped.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        SyncSettings::default().reconnect_policy()
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Parses the API base, forcing a trailing slash so relative joins keep the
/// full path.
pub fn api_base_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&with_slash).with_context(|| format!("invalid api base url '{raw}'"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!("api base url must be http or https, got '{other}'")),
    }
}

/// Realtime endpoint for an API base: `https` becomes `wss`, `http` becomes
/// `ws`, and `ws` is appended to the path.
pub fn ws_url(base: &Url) -> Result<Url> {
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("cannot derive websocket url from '{other}' scheme")),
    };
    let mut url = base.join("ws").context("failed to append ws path")?;
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("failed to switch url scheme to {scheme}"))?;
    Ok(url)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
