//! Inbound webhook payloads.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// DepositEvent is a custody push about an address the platform watches.
/// It does not state the direction of the movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositEvent {
    /// External reference, unique per on-chain movement.
    #[serde(alias = "id")]
    pub reference: String,
    pub subscription_id: Option<String>,
    pub address: Option<String>,
    pub currency: Option<String>,
    pub amount: Option<Decimal>,
    pub tx_hash: Option<String>,
    /// Sender, used to return short deposits.
    pub from_address: Option<String>,
    pub network: Option<String>,
}

impl DepositEvent {
    pub fn validate(&self) -> Result<(), String> {
        if self.reference.trim().is_empty() {
            return Err("reference is required".to_string());
        }
        let subscription = self.subscription_id.as_deref().unwrap_or("");
        let address = self.address.as_deref().unwrap_or("");
        if subscription.is_empty() && address.is_empty() {
            return Err("subscription_id or address is required".to_string());
        }
        Ok(())
    }
}

/// What a payment gateway callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEventKind {
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payout.succeeded")]
    PayoutSucceeded,
    #[serde(rename = "payout.failed")]
    PayoutFailed,
}

impl std::fmt::Display for PaymentEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentEventKind::PaymentSucceeded => "payment.succeeded",
            PaymentEventKind::PaymentFailed => "payment.failed",
            PaymentEventKind::PayoutSucceeded => "payout.succeeded",
            PaymentEventKind::PayoutFailed => "payout.failed",
        };
        write!(f, "{}", s)
    }
}

/// PaymentCallback is an asynchronous gateway notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub event: PaymentEventKind,
    /// Our reference (`dep_<id>` for deposits, `pay_<id>` for payouts).
    pub reference: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    /// Gateway-side identifier.
    pub external_id: Option<String>,
    /// Customer the gateway resolved the payment to.
    pub user_id: Option<String>,
    /// Failure description.
    pub reason: Option<String>,
}

impl PaymentCallback {
    pub fn validate(&self) -> Result<(), String> {
        if self.reference.trim().is_empty() {
            return Err("reference is required".to_string());
        }
        if let Some(amount) = self.amount {
            if amount <= Decimal::ZERO {
                return Err("amount must be positive".to_string());
            }
        }
        Ok(())
    }
}
