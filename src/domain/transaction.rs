//! Immutable audit rows for every movement of funds.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a transaction relative to its wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Credit,
    Debit,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Credit => write!(f, "CREDIT"),
            TransactionType::Debit => write!(f, "DEBIT"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(TransactionType::Credit),
            "DEBIT" => Ok(TransactionType::Debit),
            _ => Err(format!("Unknown transaction type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Success => write!(f, "SUCCESS"),
            TransactionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "SUCCESS" => Ok(TransactionStatus::Success),
            "FAILED" => Ok(TransactionStatus::Failed),
            _ => Err(format!("Unknown transaction status: {}", s)),
        }
    }
}

/// What caused the movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Transfer,
    EscrowSettlement,
    Fee,
    Payout,
    Refund,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Transfer => "transfer",
            TransactionKind::EscrowSettlement => "escrow_settlement",
            TransactionKind::Fee => "fee",
            TransactionKind::Payout => "payout",
            TransactionKind::Refund => "refund",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            "transfer" => Ok(TransactionKind::Transfer),
            "escrow_settlement" => Ok(TransactionKind::EscrowSettlement),
            "fee" => Ok(TransactionKind::Fee),
            "payout" => Ok(TransactionKind::Payout),
            "refund" => Ok(TransactionKind::Refund),
            _ => Err(format!("Unknown transaction kind: {}", s)),
        }
    }
}

/// Transaction is unique per (reference, wallet). A transfer produces a
/// debit and a credit row sharing one reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Idempotency key: external event id or internal transfer reference.
    pub reference: String,
    pub wallet_id: String,
    pub user_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Awaiting this movement belongs to, if any.
    pub awaiting_id: Option<String>,
    /// On-chain hash or gateway id, when the provider returns one.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        reference: impl Into<String>,
        wallet_id: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        tx_type: TransactionType,
        kind: TransactionKind,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reference: reference.into(),
            wallet_id: wallet_id.into(),
            user_id: None,
            amount,
            currency: currency.into(),
            tx_type,
            kind,
            status: TransactionStatus::Success,
            awaiting_id: None,
            external_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_awaiting(mut self, awaiting_id: impl Into<String>) -> Self {
        self.awaiting_id = Some(awaiting_id.into());
        self
    }

    pub fn with_external_id(mut self, external_id: Option<String>) -> Self {
        self.external_id = external_id;
        self
    }
}

/// ReconciliationGap records a fill whose bookkeeping committed but whose
/// fund leg did not complete. It is resolved by operations, never automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationGap {
    pub id: String,
    pub order_id: String,
    pub awaiting_id: Option<String>,
    /// Which leg failed (e.g. "escrow_settlement", "payment_transfer").
    pub leg: String,
    pub amount: Decimal,
    pub currency: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}
