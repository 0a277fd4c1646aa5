//! Notification configuration.

use serde::Deserialize;

/// Notification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// HTTP notification dispatcher.
    pub dispatcher: Option<DispatcherConfig>,
}

/// Notification dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Whether notifications are delivered.
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint that accepts notification jobs.
    pub url: Option<String>,
    /// Bearer token (loaded from NOTIFY_DISPATCHER_TOKEN env var).
    #[serde(skip)]
    pub token: String,
    /// Notify order owners and fillers about settled fills.
    #[serde(default = "default_true")]
    pub notify_fills: bool,
    /// Notify wallet owners about deposits.
    #[serde(default = "default_true")]
    pub notify_deposits: bool,
    /// Notify wallet owners about withdrawals and payouts.
    #[serde(default = "default_true")]
    pub notify_withdrawals: bool,
    /// Notify fillers when an awaiting expires or is refunded.
    #[serde(default = "default_true")]
    pub notify_expiry: bool,
    /// Notify about failed fills and payouts.
    #[serde(default = "default_true")]
    pub notify_errors: bool,
}

fn default_true() -> bool {
    true
}
