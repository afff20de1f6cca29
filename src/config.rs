//! Environment configuration.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::api;
use crate::error::{LedgerError, Result};
use crate::ledger::DEFAULT_BUCKET_MINUTES;
use crate::storage;

pub const DEFAULT_DATA_DIR: &str = ".dealer-ledger";
pub const DEFAULT_LOG_FILTER: &str = "info,dealer_ledger=debug";

#[derive(Clone)]
pub struct LedgerConfig {
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub settle_timeout: Duration,
    pub timestamp_bucket_minutes: u32,
    pub log_filter: String,
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("webhook_url", &self.webhook_url)
            .field(
                "webhook_token",
                &self.webhook_token.as_deref().map(storage::mask_secret),
            )
            .field("data_dir", &self.data_dir)
            .field("request_timeout", &self.request_timeout)
            .field("settle_timeout", &self.settle_timeout)
            .field("timestamp_bucket_minutes", &self.timestamp_bucket_minutes)
            .field("log_filter", &self.log_filter)
            .finish()
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_token: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            request_timeout: api::DEFAULT_TIMEOUT,
            settle_timeout: Duration::from_secs(45),
            timestamp_bucket_minutes: DEFAULT_BUCKET_MINUTES,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl LedgerConfig {
    /// Read the environment, falling back to the OS keyring for the webhook
    /// URL and token.
    pub fn from_env() -> Self {
        Self::from_env_with(storage::get_credential)
    }

    /// Same as [`from_env`](Self::from_env) with an explicit credential lookup.
    pub fn from_env_with(credential: impl Fn(&str) -> Option<String>) -> Self {
        let connection = env_opt("LEDGER_CONNECTION");
        let from_connection = |extract: fn(&str) -> Option<String>| {
            connection.as_deref().and_then(extract)
        };

        let webhook_url = env_opt("LEDGER_WEBHOOK_URL")
            .map(|u| api::normalize_webhook_url(&u))
            .or_else(|| from_connection(api::extract_url_from_connection_string))
            .or_else(|| credential(storage::KEY_WEBHOOK_URL));
        let webhook_token = env_opt("LEDGER_WEBHOOK_TOKEN")
            .or_else(|| from_connection(api::extract_token_from_connection_string))
            .or_else(|| credential(storage::KEY_WEBHOOK_TOKEN));

        let defaults = Self::default();
        Self {
            webhook_url,
            webhook_token,
            data_dir: env_opt("LEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            request_timeout: Duration::from_secs(
                env_parse_or("LEDGER_REQUEST_TIMEOUT_SECS", 30u64).max(1),
            ),
            settle_timeout: Duration::from_secs(
                env_parse_or("LEDGER_SETTLE_TIMEOUT_SECS", 45u64).max(1),
            ),
            timestamp_bucket_minutes: env_parse_or(
                "LEDGER_TIMESTAMP_BUCKET_MINUTES",
                DEFAULT_BUCKET_MINUTES,
            )
            .max(1),
            log_filter: env_opt("LEDGER_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Webhook URL, or a config error naming where it can be set.
    pub fn require_webhook_url(&self) -> Result<&str> {
        self.webhook_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                LedgerError::Config(
                    "webhook URL missing: set LEDGER_WEBHOOK_URL or LEDGER_CONNECTION, or store it in the keyring"
                        .to_string(),
                )
            })
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}
