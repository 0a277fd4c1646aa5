//! Reservation and settlement configuration.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use super::duration;

/// Reservation, settlement and retry-queue settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettlementConfig {
    /// How long a PENDING awaiting holds its reservation (default: 30m).
    #[serde(default, with = "duration")]
    pub reservation_ttl: Duration,
    /// In-process retries after a version conflict (default: 2).
    pub conflict_retries: Option<u32>,
    /// Fixed delay between in-process conflict retries (default: 50ms).
    #[serde(default, with = "duration")]
    pub conflict_retry_delay: Duration,
    /// How often the retry queue is drained (default: 5s).
    #[serde(default, with = "duration")]
    pub retry_poll_interval: Duration,
    /// Queue attempts before a fill is failed (default: 8).
    pub retry_max_attempts: Option<u32>,
    /// First queue backoff (default: 1s).
    #[serde(default, with = "duration")]
    pub retry_base_backoff: Duration,
    /// Backoff cap (default: 5m).
    #[serde(default, with = "duration")]
    pub retry_max_backoff: Duration,
    /// How often stale PENDING awaitings are swept (default: 1m).
    #[serde(default, with = "duration")]
    pub expiry_sweep_interval: Duration,
    /// How often runtime stats are logged (default: 1h).
    #[serde(default, with = "duration")]
    pub stats_interval: Duration,
    /// Placement fee as a fraction of the order amount (e.g. "0.005").
    pub fee_rate: Option<Decimal>,
    /// Wallet that collects placement fees, one per currency keyed by code.
    #[serde(default)]
    pub fee_wallets: std::collections::HashMap<String, String>,
    /// Platform operational wallet; its debits are not notified.
    pub operational_wallet_id: Option<String>,
}

impl SettlementConfig {
    pub fn reservation_ttl(&self) -> Duration {
        duration::or_default(self.reservation_ttl, Duration::from_secs(30 * 60))
    }

    pub fn conflict_retries(&self) -> u32 {
        self.conflict_retries.unwrap_or(2)
    }

    pub fn conflict_retry_delay(&self) -> Duration {
        duration::or_default(self.conflict_retry_delay, Duration::from_millis(50))
    }

    pub fn retry_poll_interval(&self) -> Duration {
        duration::or_default(self.retry_poll_interval, Duration::from_secs(5))
    }

    pub fn retry_max_attempts(&self) -> u32 {
        self.retry_max_attempts.unwrap_or(8)
    }

    /// Queue backoff before attempt `attempt` (1-based), doubling and capped.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let base = duration::or_default(self.retry_base_backoff, Duration::from_secs(1));
        let max = duration::or_default(self.retry_max_backoff, Duration::from_secs(300));
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        duration::or_default(self.expiry_sweep_interval, Duration::from_secs(60))
    }

    pub fn stats_interval(&self) -> Duration {
        duration::or_default(self.stats_interval, Duration::from_secs(3600))
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate.unwrap_or(Decimal::ZERO)
    }

    pub fn fee_wallet(&self, currency: &str) -> Option<&str> {
        self.fee_wallets
            .get(&currency.to_uppercase())
            .map(String::as_str)
    }
}
