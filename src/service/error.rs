//! Service error types.

use crate::ledger::LedgerError;
use crate::notification::NotificationError;
use crate::payments::PaymentError;
use crate::storage::StorageError;

/// Service error type.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,
    #[error("config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("payment gateway error: {0}")]
    Payment(#[from] PaymentError),
    #[error("notification error: {0}")]
    Notification(#[from] NotificationError),
}
