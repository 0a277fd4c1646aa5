//! Storage interfaces and implementations for orders, fills and funds.
//!
//! Every write that races with another request is a single conditional
//! statement (or a short transaction of them); nothing here holds a lock
//! across a network call.

mod sqlite;

pub use sqlite::{SqliteStorage, SqliteStorageConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{
    Awaiting, AwaitingStatus, BalanceChange, FillRecord, Order, OrderStatus, ReconciliationGap,
    Transaction, TransactionStatus, Wallet,
};

/// Outcome of a conditional capacity reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Capacity claimed and the awaiting inserted.
    Reserved,
    /// The order is missing, not open, or lacks capacity; nothing was written.
    Unavailable,
    /// Another PENDING awaiting already watches the deposit address.
    AddressBusy,
}

/// Outcome of a version-guarded fill update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillApply {
    /// Order totals, awaiting flag and fill log committed together.
    Applied,
    /// The order changed since it was read; nothing was written.
    VersionConflict,
    /// The awaiting was already applied or its reservation released.
    AlreadyApplied,
}

/// FillUpdate is everything needed to commit one fill against an order.
#[derive(Debug, Clone)]
pub struct FillUpdate {
    pub order_id: String,
    pub awaiting_id: String,
    /// Version read before computing this update.
    pub expected_version: i64,
    /// Amount drawn from the order, in the order currency.
    pub order_amount: Decimal,
    pub percentage_processed: Decimal,
    pub status: OrderStatus,
    pub record: FillRecord,
}

/// RetryEntry is a settlement deferred after repeated version conflicts.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub awaiting_id: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &Order) -> Result<(), StorageError>;

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StorageError>;

    /// Adds `amount` to amount_reserved only if the order is OPEN and
    /// amount - amount_processed - amount_reserved >= amount, and inserts the
    /// awaiting in the same transaction.
    async fn reserve_capacity(
        &self,
        order_id: &str,
        amount: Decimal,
        awaiting: &Awaiting,
    ) -> Result<ReserveOutcome, StorageError>;

    /// Marks the awaiting's reservation released (only if it is in `from`,
    /// not yet released and not applied) and subtracts `amount` from the
    /// order's amount_reserved, never below zero. Returns false when the
    /// reservation was not outstanding.
    async fn release_reservation(
        &self,
        awaiting_id: &str,
        from: AwaitingStatus,
        amount: Decimal,
    ) -> Result<bool, StorageError>;

    /// Commits a fill guarded on the order version.
    async fn apply_fill(&self, update: &FillUpdate) -> Result<FillApply, StorageError>;

    /// Sets CANCELED if the version matches, the order is OPEN, nothing is
    /// reserved and no awaiting is PENDING or PROCESSING.
    async fn cancel_order(&self, order_id: &str, expected_version: i64)
    -> Result<bool, StorageError>;

    async fn list_fills(&self, order_id: &str) -> Result<Vec<FillRecord>, StorageError>;
}

#[async_trait]
pub trait AwaitingStore: Send + Sync {
    async fn get_awaiting(&self, id: &str) -> Result<Option<Awaiting>, StorageError>;

    /// Moves `from` -> `to`. Returns false if the awaiting was not in `from`.
    async fn transition_awaiting(
        &self,
        id: &str,
        from: AwaitingStatus,
        to: AwaitingStatus,
        reason: Option<&str>,
    ) -> Result<bool, StorageError>;

    /// PENDING -> PROCESSING, only while the reservation is outstanding.
    async fn claim_awaiting(&self, id: &str) -> Result<bool, StorageError>;

    async fn find_pending_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Awaiting>, StorageError>;

    async fn find_pending_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Awaiting>, StorageError>;

    async fn record_shortfall(&self, id: &str, shortfall: Decimal) -> Result<(), StorageError>;

    /// Sets the filler on an awaiting that has none yet.
    async fn assign_awaiting_user(&self, id: &str, user_id: &str) -> Result<bool, StorageError>;

    /// Number of PENDING or PROCESSING awaitings on an order.
    async fn count_active_awaitings(&self, order_id: &str) -> Result<i64, StorageError>;

    /// PENDING awaitings created before the cutoff, oldest first.
    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Awaiting>, StorageError>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<(), StorageError>;

    async fn get_wallet(&self, id: &str) -> Result<Option<Wallet>, StorageError>;

    async fn find_wallet_by_address(&self, address: &str) -> Result<Option<Wallet>, StorageError>;

    async fn find_wallet_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Wallet>, StorageError>;

    /// Overwrites the cached balances and returns old and new values.
    async fn update_balances(
        &self,
        id: &str,
        account: Decimal,
        available: Decimal,
    ) -> Result<BalanceChange, StorageError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts unless (reference, wallet_id) already exists.
    /// Returns true if the transaction was saved (new), false if it already exists.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, StorageError>;

    async fn find_transaction(
        &self,
        reference: &str,
        wallet_id: &str,
    ) -> Result<Option<Transaction>, StorageError>;

    async fn find_transactions_by_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<Transaction>, StorageError>;

    /// Moves a transaction `from` -> `to`. Returns false if it was not in `from`.
    async fn transition_transaction(
        &self,
        reference: &str,
        wallet_id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool, StorageError>;

    /// Fails every PENDING transaction linked to an awaiting.
    async fn fail_pending_transactions(&self, awaiting_id: &str) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Adds or refreshes a queue entry without resetting its attempt count.
    async fn enqueue_retry(
        &self,
        awaiting_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StorageError>;

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryEntry>, StorageError>;

    /// Increments attempts and pushes the entry out. Returns the new count.
    async fn reschedule_retry(
        &self,
        awaiting_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<u32, StorageError>;

    async fn remove_retry(&self, awaiting_id: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn record_gap(&self, gap: &ReconciliationGap) -> Result<(), StorageError>;

    async fn list_gaps(&self) -> Result<Vec<ReconciliationGap>, StorageError>;
}

/// Storage is the full persistence surface used by the service.
pub trait Storage:
    OrderStore + AwaitingStore + WalletStore + TransactionStore + RetryStore + ReconciliationStore
{
}

impl<T> Storage for T where
    T: OrderStore + AwaitingStore + WalletStore + TransactionStore + RetryStore + ReconciliationStore
{
}

/// StorageError represents errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}
