//! Custody ledger configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Which custody ledger backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerProvider {
    /// Remote custody API.
    #[default]
    Http,
    /// In-process ledger for local runs.
    Memory,
}

/// Custody ledger settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub provider: LedgerProvider,
    /// Base URL of the custody API.
    pub base_url: Option<String>,
    /// Per-request timeout.
    #[serde(default, with = "duration")]
    pub timeout: Duration,
    /// Backoff for idempotent calls and verified fund-movement retries.
    #[serde(default)]
    pub retry: RetryConfig,
    /// API key (loaded from LEDGER_API_KEY env var).
    #[serde(skip)]
    pub api_key: String,
    /// API secret (loaded from LEDGER_API_SECRET env var).
    #[serde(skip)]
    pub api_secret: String,
}

impl LedgerConfig {
    pub fn timeout(&self) -> Duration {
        duration::or_default(self.timeout, DEFAULT_TIMEOUT)
    }
}

/// Retry settings for failed operations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    #[serde(default, with = "duration")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(default, with = "duration")]
    pub max_delay: Duration,
    /// Factor by which delay increases after each retry.
    pub multiplier: Option<f64>,
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3).max(1)
    }

    /// Delay before retry number `retry` (0-based), capped at max_delay.
    pub fn backoff(&self, retry: u32) -> Duration {
        let initial = duration::or_default(self.initial_delay, Duration::from_millis(200));
        let max = duration::or_default(self.max_delay, Duration::from_secs(5));
        let multiplier = self.multiplier.unwrap_or(2.0).max(1.0);
        let delay = initial.as_secs_f64() * multiplier.powi(retry as i32);
        if delay >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(delay)
    }
}
