//! Engine and backend configuration.
//!
//! `SyncConfig` tunes the sync engine; `RemoteConfig` points the REST
//! backend client at a deployment.

use std::env;
use std::time::Duration;

use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const ENV_API_URL: &str = "WANDER_API_URL";
const ENV_API_KEY: &str = "WANDER_API_KEY";
const ENV_API_TIMEOUT_SECS: &str = "WANDER_API_TIMEOUT_SECS";

const DEFAULT_PERIODIC_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_CLOCK_SKEW_MS: u64 = 1_000;
const DEFAULT_INCREMENTAL_MERGE_THRESHOLD: usize = 50;
const DEFAULT_PULL_PAGE_SIZE: usize = 1_000;
const DEFAULT_DELETE_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_DELETE_RETRY_DELAY_SECS: u64 = 1;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Tuning knobs for the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Sleep between periodic sync cycles (default: 5 minutes)
    pub periodic_interval: Duration,
    /// Subtracted from a cursor before querying so records stamped by a
    /// slightly skewed server clock are not missed (default: 1 second)
    pub clock_skew_tolerance: Duration,
    /// Pull batches up to this size are merged record-by-record instead of
    /// loading the whole local collection (default: 50)
    pub incremental_merge_threshold: usize,
    /// Page size for remote selects (default: 1000)
    pub pull_page_size: usize,
    /// Attempts for an immediate remote delete (default: 3)
    pub delete_retry_attempts: u32,
    /// Base delay between delete attempts, multiplied by the attempt number
    pub delete_retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periodic_interval: Duration::from_secs(DEFAULT_PERIODIC_INTERVAL_SECS),
            clock_skew_tolerance: Duration::from_millis(DEFAULT_CLOCK_SKEW_MS),
            incremental_merge_threshold: DEFAULT_INCREMENTAL_MERGE_THRESHOLD,
            pull_page_size: DEFAULT_PULL_PAGE_SIZE,
            delete_retry_attempts: DEFAULT_DELETE_RETRY_ATTEMPTS,
            delete_retry_delay: Duration::from_secs(DEFAULT_DELETE_RETRY_DELAY_SECS),
        }
    }
}

impl SyncConfig {
    /// Set the periodic sync interval
    #[must_use]
    pub const fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Set the clock-skew tolerance applied to cursor queries
    #[must_use]
    pub const fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    /// Set the batch size at which merges switch to the full path
    #[must_use]
    pub const fn with_incremental_merge_threshold(mut self, threshold: usize) -> Self {
        self.incremental_merge_threshold = threshold;
        self
    }

    /// Set the remote select page size (minimum 1)
    #[must_use]
    pub fn with_pull_page_size(mut self, page_size: usize) -> Self {
        self.pull_page_size = page_size.max(1);
        self
    }

    /// Set the immediate delete retry policy
    #[must_use]
    pub fn with_delete_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.delete_retry_attempts = attempts.max(1);
        self.delete_retry_delay = delay;
        self
    }

    /// Clock-skew tolerance as a chrono duration
    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.clock_skew_tolerance).unwrap_or(chrono::Duration::zero())
    }
}

/// Remote backend endpoint configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://project.example.com`
    pub base_url: String,
    /// Public API key sent with every request
    pub api_key: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteConfig {
    /// Build a validated configuration.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let api_key = normalize_text_option(Some(api_key.into()))
            .ok_or_else(|| Error::InvalidInput("API key must not be empty".to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        })
    }

    /// Set the per-request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<RemoteConfig>> {
    let base_url = normalize_text_option(lookup(ENV_API_URL));
    let api_key = normalize_text_option(lookup(ENV_API_KEY));
    let timeout = normalize_text_option(lookup(ENV_API_TIMEOUT_SECS));

    let (base_url, api_key) = match (base_url, api_key) {
        (None, None) => return Ok(None),
        (Some(base_url), Some(api_key)) => (base_url, api_key),
        (Some(_), None) => {
            return Err(Error::InvalidInput(format!(
                "{ENV_API_KEY} must be set when {ENV_API_URL} is set"
            )))
        }
        (None, Some(_)) => {
            return Err(Error::InvalidInput(format!(
                "{ENV_API_URL} must be set when {ENV_API_KEY} is set"
            )))
        }
    };

    let mut config = RemoteConfig::new(base_url, api_key)?;
    if let Some(timeout) = timeout {
        let seconds = timeout.parse::<u64>().map_err(|_| {
            Error::InvalidInput(format!("{ENV_API_TIMEOUT_SECS} must be a whole number"))
        })?;
        config = config.with_timeout(Duration::from_secs(seconds));
    }
    Ok(Some(config))
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("base URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "base URL must include http:// or https://".to_string(),
        ))
    }
}
