//! Payment gateway and webhook configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Payment gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    /// Whether fiat funding and bank payouts are available.
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the gateway API.
    pub base_url: Option<String>,
    /// Per-request timeout.
    #[serde(default, with = "duration")]
    pub timeout: Duration,
    /// Deadline for initiating a deposit; on expiry the reservation is released.
    #[serde(default, with = "duration")]
    pub init_timeout: Duration,
    /// Secret key (loaded from PAYMENTS_SECRET_KEY env var).
    #[serde(skip)]
    pub secret_key: String,
}

impl PaymentsConfig {
    pub fn timeout(&self) -> Duration {
        duration::or_default(self.timeout, DEFAULT_TIMEOUT)
    }

    pub fn init_timeout(&self) -> Duration {
        duration::or_default(self.init_timeout, DEFAULT_INIT_TIMEOUT)
    }
}

/// Shared secrets for inbound webhook signatures. Both secrets come from the
/// environment only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Accept webhooks without a signature check while a secret is unset.
    /// Refused in production.
    #[serde(default)]
    pub allow_unsigned: bool,
    /// Secret for custody deposit events (DEPOSIT_WEBHOOK_SECRET).
    #[serde(skip)]
    pub deposit_secret: String,
    /// Secret for payment gateway callbacks (PAYMENT_WEBHOOK_SECRET).
    #[serde(skip)]
    pub payment_secret: String,
}
