//! Settlement error types.

use thiserror::Error;

use crate::decimal::DecimalError;
use crate::domain::{RejectReason, Rejection};
use crate::ledger::LedgerError;
use crate::payments::PaymentError;
use crate::storage::StorageError;

/// Errors from reservation, settlement and cancellation.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Synchronous, caller-actionable refusal. Nothing was changed.
    #[error("rejected: {0}")]
    Rejected(Rejection),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("amount error: {0}")]
    Amount(#[from] DecimalError),
}

impl SettlementError {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        SettlementError::Rejected(Rejection::new(reason, message))
    }

    /// Returns the rejection reason, if this is a rejection.
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            SettlementError::Rejected(rejection) => Some(rejection.reason),
            _ => None,
        }
    }
}

impl From<Rejection> for SettlementError {
    fn from(rejection: Rejection) -> Self {
        SettlementError::Rejected(rejection)
    }
}

/// Result type for settlement operations.
pub type Result<T> = std::result::Result<T, SettlementError>;
