//! Awaitings: tracked attempts to fill part of an order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderType;

/// AwaitingStatus is the lifecycle of a fill attempt.
///
/// Transitions are monotonic: PENDING -> PROCESSING -> terminal, or
/// PENDING -> terminal when the attempt is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AwaitingStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Expired,
    Refunded,
}

impl AwaitingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AwaitingStatus::Pending | AwaitingStatus::Processing)
    }

    /// Returns true if moving from self to next respects the lifecycle order.
    pub fn can_transition_to(&self, next: AwaitingStatus) -> bool {
        match self {
            AwaitingStatus::Pending => next != AwaitingStatus::Pending,
            AwaitingStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for AwaitingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AwaitingStatus::Pending => "PENDING",
            AwaitingStatus::Processing => "PROCESSING",
            AwaitingStatus::Success => "SUCCESS",
            AwaitingStatus::Failed => "FAILED",
            AwaitingStatus::Expired => "EXPIRED",
            AwaitingStatus::Refunded => "REFUNDED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AwaitingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AwaitingStatus::Pending),
            "PROCESSING" => Ok(AwaitingStatus::Processing),
            "SUCCESS" => Ok(AwaitingStatus::Success),
            "FAILED" => Ok(AwaitingStatus::Failed),
            "EXPIRED" => Ok(AwaitingStatus::Expired),
            "REFUNDED" => Ok(AwaitingStatus::Refunded),
            _ => Err(format!("Unknown awaiting status: {}", s)),
        }
    }
}

/// Funding describes how the filler's payment reaches the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Funding {
    /// Paid directly from the filler's own wallet.
    Wallet,
    /// Paid on-chain to the deposit address of an intermediary wallet.
    CryptoDeposit,
    /// Paid through the payment gateway into an intermediary wallet.
    FiatPayment,
}

impl std::fmt::Display for Funding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Funding::Wallet => write!(f, "wallet"),
            Funding::CryptoDeposit => write!(f, "crypto_deposit"),
            Funding::FiatPayment => write!(f, "fiat_payment"),
        }
    }
}

impl std::str::FromStr for Funding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet" => Ok(Funding::Wallet),
            "crypto_deposit" => Ok(Funding::CryptoDeposit),
            "fiat_payment" => Ok(Funding::FiatPayment),
            _ => Err(format!("Unknown funding: {}", s)),
        }
    }
}

/// DeliveryTarget is where the settled order-currency leg is paid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryTarget {
    /// Bank account, for the fiat leg of a BUY order.
    Bank {
        bank_code: String,
        account_number: String,
        account_name: Option<String>,
    },
    /// On-chain address, for the crypto leg of a SELL order.
    Address {
        address: String,
        network: Option<String>,
    },
}

/// Awaiting is one reservation of order capacity and its settlement progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Awaiting {
    pub id: String,
    pub order_id: String,
    pub order_type: OrderType,
    /// Requested fill in the filler currency.
    pub amount: Decimal,
    /// Same fill converted to the order currency at the order price.
    pub order_amount: Decimal,
    /// Filler currency code.
    pub currency: String,
    pub status: AwaitingStatus,
    /// Filler, when known. Payment flows may only establish it on callback.
    pub user_id: Option<String>,
    pub funding: Funding,
    /// Wallet (filler currency) the payment is drawn from.
    pub payer_wallet_id: String,
    /// Wallet (order currency) that receives the escrow draw.
    pub receiver_wallet_id: String,
    /// Deposit address watched for CryptoDeposit funding.
    pub deposit_address: Option<String>,
    /// Gateway reference for FiatPayment funding.
    pub payment_reference: Option<String>,
    /// Final payout destination; None when the receiver wallet is the destination.
    pub delivery: Option<DeliveryTarget>,
    /// Amount the deposit fell short by, when refunded.
    pub shortfall: Option<Decimal>,
    pub failure_reason: Option<String>,
    /// Set once the reservation has been returned to the order.
    pub reservation_released: bool,
    /// Set once the fill has been applied to the order totals.
    pub fill_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Awaiting {
    /// Key used for the scheduled expiry of this awaiting.
    pub fn expiry_key(&self) -> String {
        expiry_key(&self.id)
    }
}

pub fn expiry_key(awaiting_id: &str) -> String {
    format!("awaiting-expiry:{}", awaiting_id)
}
