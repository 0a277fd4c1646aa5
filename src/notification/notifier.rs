use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Category of a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A fill settled against an order.
    Fill,
    /// Funds arrived in a wallet.
    Deposit,
    /// Funds left a wallet or a payout completed.
    Withdrawal,
    /// A reservation aged out.
    Expiry,
    /// A short deposit was sent back.
    Refund,
    /// A fill or payout failed.
    Error,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Fill => write!(f, "fill"),
            NotificationKind::Deposit => write!(f, "deposit"),
            NotificationKind::Withdrawal => write!(f, "withdrawal"),
            NotificationKind::Expiry => write!(f, "expiry"),
            NotificationKind::Refund => write!(f, "refund"),
            NotificationKind::Error => write!(f, "error"),
        }
    }
}

/// Notification is one message for one user.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            content: content.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// Tells the order owner a fill settled.
    pub fn fill_settled_owner(
        user_id: &str,
        order_id: &str,
        sold: Decimal,
        sold_currency: &str,
        received: Decimal,
        received_currency: &str,
        percentage: Decimal,
    ) -> Self {
        Self::new(
            user_id,
            NotificationKind::Fill,
            "Order partially filled",
            format!(
                "Order {}: {} {} exchanged for {} {}. {}% processed.",
                short_id(order_id),
                format_amount(sold),
                sold_currency,
                format_amount(received),
                received_currency,
                percentage
            ),
        )
    }

    /// Tells the filler their fill settled.
    pub fn fill_settled_filler(
        user_id: &str,
        paid: Decimal,
        paid_currency: &str,
        received: Decimal,
        received_currency: &str,
    ) -> Self {
        Self::new(
            user_id,
            NotificationKind::Fill,
            "Fill completed",
            format!(
                "You paid {} {} and received {} {}.",
                format_amount(paid),
                paid_currency,
                format_amount(received),
                received_currency
            ),
        )
    }

    pub fn deposit_received(user_id: &str, amount: Decimal, currency: &str) -> Self {
        Self::new(
            user_id,
            NotificationKind::Deposit,
            "Deposit received",
            format!("{} {} was credited to your wallet.", format_amount(amount), currency),
        )
    }

    pub fn withdrawal_completed(user_id: &str, amount: Decimal, currency: &str) -> Self {
        Self::new(
            user_id,
            NotificationKind::Withdrawal,
            "Withdrawal completed",
            format!("{} {} left your wallet.", format_amount(amount), currency),
        )
    }

    pub fn awaiting_expired(user_id: &str, awaiting_id: &str, ttl: Duration) -> Self {
        Self::new(
            user_id,
            NotificationKind::Expiry,
            "Reservation expired",
            format!(
                "No payment arrived for request {} within {}. The reservation was released.",
                short_id(awaiting_id),
                format_duration(ttl)
            ),
        )
    }

    pub fn refund_issued(
        user_id: &str,
        refunded: Decimal,
        shortfall: Decimal,
        currency: &str,
    ) -> Self {
        Self::new(
            user_id,
            NotificationKind::Refund,
            "Deposit refunded",
            format!(
                "Your deposit was {} {} short. {} {} is being returned to the sender.",
                format_amount(shortfall),
                currency,
                format_amount(refunded),
                currency
            ),
        )
    }

    pub fn fill_failed(user_id: &str, awaiting_id: &str, reason: &str) -> Self {
        Self::new(
            user_id,
            NotificationKind::Error,
            "Fill failed",
            format!("Request {} could not be completed: {}", short_id(awaiting_id), reason),
        )
    }

    pub fn payout_failed(user_id: &str, amount: Decimal, currency: &str) -> Self {
        Self::new(
            user_id,
            NotificationKind::Error,
            "Payout failed",
            format!(
                "A payout of {} {} failed. The funds were returned to your wallet.",
                format_amount(amount),
                currency
            ),
        )
    }
}

/// Notifier delivers notifications. `enqueue` never blocks and never fails
/// the caller.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification and waits for the outcome.
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;

    /// Queues a notification for background delivery.
    fn enqueue(&self, notification: Notification);

    /// Returns true if this kind of notification is delivered.
    fn is_enabled(&self, kind: NotificationKind) -> bool;

    /// Flushes pending deliveries.
    async fn close(&self) -> Result<(), NotificationError>;
}

/// Notification errors.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notifier misconfigured: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("dispatcher error: {status} - {body}")]
    Dispatcher { status: u16, body: String },
}

/// NoopNotifier drops everything.
#[derive(Default)]
pub struct NoopNotifier;

impl NoopNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _notification: &Notification) -> Result<(), NotificationError> {
        Ok(())
    }

    fn enqueue(&self, _notification: Notification) {}

    fn is_enabled(&self, _kind: NotificationKind) -> bool {
        false
    }

    async fn close(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}

// === Formatting helpers ===

/// First eight characters of an id, enough to recognize it in a message.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Formats an amount with thousand separators, trailing zeros removed.
pub fn format_amount(amount: Decimal) -> String {
    let normalized = amount.normalize().to_string();
    let (sign, unsigned) = match normalized.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", normalized.as_str()),
    };
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (unsigned, None),
    };

    let mut result = String::from(sign);
    result.push_str(&add_thousand_separators(whole));
    if let Some(fraction) = fraction {
        result.push('.');
        result.push_str(fraction);
    }
    result
}

/// Formats a duration as its two largest units.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}m {}s", secs / 60, secs % 60)
        }
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Inserts a comma every three digits from the right.
fn add_thousand_separators(digits: &str) -> String {
    let mut result = String::new();
    for (i, c) in digits.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
