//! Custody ledger access.
//!
//! The external ledger is authoritative for every balance. [`CustodyLedger`]
//! is the raw provider surface; [`LedgerGateway`] wraps it with audit rows,
//! wallet-cache resync and bounded retries.

mod gateway;
mod http;
mod memory;

pub use gateway::{LedgerGateway, Posting};
pub use http::HttpCustodyLedger;
pub use memory::InMemoryLedger;
#[cfg(test)]
pub use memory::FailureMode;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Authoritative balances of one ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Total balance including funds under holds.
    pub account: Decimal,
    /// Balance free to spend.
    pub available: Decimal,
}

/// LedgerEntry is what the ledger recorded for one idempotency reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub reference: String,
    /// Hold created by an escrow call.
    pub hold_id: Option<String>,
    /// On-chain hash for withdrawals.
    pub external_id: Option<String>,
    /// Amount returned by a release.
    pub amount: Option<Decimal>,
}

/// CustodyLedger is the provider API. Every fund-moving call carries a
/// caller-chosen reference that the provider records, so an uncertain
/// outcome can be checked with [`CustodyLedger::lookup`].
#[async_trait]
pub trait CustodyLedger: Send + Sync {
    async fn balance(&self, account_id: &str) -> Result<AccountBalance, LedgerError>;

    /// Places a hold on `amount` of the account's available balance.
    async fn escrow(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<String, LedgerError>;

    /// Releases whatever is left on a hold. Returns the released amount.
    async fn release_escrow(&self, hold_id: &str, reference: &str) -> Result<Decimal, LedgerError>;

    /// Draws `amount` from a hold straight into `recipient_id`.
    async fn settle_escrow(
        &self,
        hold_id: &str,
        amount: Decimal,
        recipient_id: &str,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn transfer(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Mints into an account.
    async fn credit(&self, account_id: &str, amount: Decimal, reference: &str)
    -> Result<(), LedgerError>;

    /// Burns from an account's available balance.
    async fn debit(&self, account_id: &str, amount: Decimal, reference: &str)
    -> Result<(), LedgerError>;

    /// Sends funds on-chain. Returns the transaction hash when known.
    async fn withdraw(
        &self,
        account_id: &str,
        amount: Decimal,
        address: &str,
        network: Option<&str>,
        reference: &str,
    ) -> Result<Option<String>, LedgerError>;

    /// Returns the entry committed under `reference`, if any.
    async fn lookup(&self, reference: &str) -> Result<Option<LedgerEntry>, LedgerError>;
}

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds in {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        account: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("hold not found: {0}")]
    HoldNotFound(String),

    #[error("hold {hold_id} exhausted: requested {requested}, remaining {remaining}")]
    HoldExhausted {
        hold_id: String,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("ledger temporarily unavailable: {0}")]
    Transient(String),

    #[error("ledger rejected request: {0}")]
    Rejected(String),

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Returns true if the outcome of the call is unknown and it may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Transient(_) => true,
            LedgerError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
