//! Shared fixtures for unit tests: domain builders, recording doubles and a
//! fully wired harness over in-memory storage and ledger.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::{RetryConfig, SettlementConfig, WebhookConfig};
use crate::domain::{
    Awaiting, AwaitingStatus, BalanceChange, Currency, CurrencyKind, FillRecord, Funding, Order,
    OrderStatus, OrderType, ReconciliationGap, StaticCatalog, Transaction, TransactionKind,
    TransactionStatus, Wallet,
};
use crate::events::EventPipeline;
use crate::ledger::{CustodyLedger, InMemoryLedger, LedgerGateway, Posting};
use crate::notification::{Notification, NotificationError, NotificationKind, Notifier};
use crate::payments::{
    DepositInstructions, DepositRequest, PaymentError, PaymentGateway, PayoutReceipt,
    PayoutRequest, ResolvedAccount,
};
use crate::reservation::ReservationManager;
use crate::scheduler::{ScheduledAction, Scheduler};
use crate::service::Counters;
use crate::settlement::{OrderRequest, SettlementEngine};
use crate::storage::{
    AwaitingStore, FillApply, FillUpdate, OrderStore, ReconciliationStore, ReserveOutcome,
    RetryEntry, RetryStore, SqliteStorage, SqliteStorageConfig, Storage, StorageError,
    TransactionStore, WalletStore,
};

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

// ==================== Domain builders ====================

/// An OPEN BTC/NGN order at version 0 with nothing processed or reserved.
pub fn order(order_type: OrderType, amount: Decimal, price: Decimal, minimum: Decimal) -> Order {
    let now = Utc::now();
    let (wallet_id, proceeds_wallet_id) = match order_type {
        OrderType::Sell => ("owner-btc", "owner-ngn"),
        OrderType::Buy => ("owner-ngn", "owner-btc"),
    };
    Order {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: "owner".to_string(),
        base_currency: "BTC".to_string(),
        quote_currency: "NGN".to_string(),
        order_type,
        amount,
        amount_processed: Decimal::ZERO,
        amount_reserved: Decimal::ZERO,
        amount_minimum: minimum,
        price,
        fee: Decimal::ZERO,
        percentage_processed: Decimal::ZERO,
        status: OrderStatus::Open,
        version: 0,
        escrow_hold_id: format!("hold-{}", uuid::Uuid::new_v4().simple()),
        wallet_id: wallet_id.to_string(),
        proceeds_wallet_id: proceeds_wallet_id.to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// A PENDING wallet-funded awaiting against `order`.
pub fn awaiting(order: &Order, amount: Decimal, order_amount: Decimal) -> Awaiting {
    let now = Utc::now();
    let (payer, receiver) = match order.order_type {
        OrderType::Sell => ("filler-ngn", "filler-btc"),
        OrderType::Buy => ("filler-btc", "filler-ngn"),
    };
    Awaiting {
        id: uuid::Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        order_type: order.order_type,
        amount,
        order_amount,
        currency: order.filler_currency().to_string(),
        status: AwaitingStatus::Pending,
        user_id: Some("filler".to_string()),
        funding: Funding::Wallet,
        payer_wallet_id: payer.to_string(),
        receiver_wallet_id: receiver.to_string(),
        deposit_address: None,
        payment_reference: None,
        delivery: None,
        shortfall: None,
        failure_reason: None,
        reservation_released: false,
        fill_applied: false,
        created_at: now,
        updated_at: now,
    }
}

pub fn catalog() -> StaticCatalog {
    StaticCatalog::new([
        Currency::new("BTC", CurrencyKind::Crypto, d("0.0001")),
        Currency::new("USDT", CurrencyKind::Crypto, d("1")),
        Currency::new("NGN", CurrencyKind::Fiat, d("1")),
    ])
}

/// Settlement settings with short delays so tests never wait long.
pub fn settlement_config() -> SettlementConfig {
    SettlementConfig {
        conflict_retry_delay: Duration::from_millis(1),
        retry_base_backoff: Duration::from_millis(1),
        retry_max_backoff: Duration::from_millis(10),
        ..SettlementConfig::default()
    }
}

pub fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: Some(2),
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: Some(2.0),
    }
}

// ==================== Doubles ====================

/// RecordingNotifier keeps every enqueued notification.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|n| n.kind == kind).count()
    }

    pub fn titles_for(&self, user_id: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.title)
            .collect()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.enqueue(notification.clone());
        Ok(())
    }

    fn enqueue(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }

    fn is_enabled(&self, _kind: NotificationKind) -> bool {
        true
    }

    async fn close(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// ManualScheduler records timers; tests fire them by hand.
#[derive(Default)]
pub struct ManualScheduler {
    timers: Mutex<HashMap<String, (ScheduledAction, Duration)>>,
}

impl ManualScheduler {
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers.lock().unwrap().contains_key(key)
    }

    pub fn delay(&self, key: &str) -> Option<Duration> {
        self.timers.lock().unwrap().get(key).map(|(_, delay)| *delay)
    }

    /// Removes the timer and returns the action it would have delivered.
    pub fn fire(&self, key: &str) -> Option<ScheduledAction> {
        self.timers.lock().unwrap().remove(key).map(|(action, _)| action)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, key: &str, action: ScheduledAction, delay: Duration) {
        self.timers
            .lock()
            .unwrap()
            .insert(key.to_string(), (action, delay));
    }

    fn cancel(&self, key: &str) -> bool {
        self.timers.lock().unwrap().remove(key).is_some()
    }
}

/// ScriptedPayments is a payment gateway whose failures are switched on
/// per test.
#[derive(Default)]
pub struct ScriptedPayments {
    pub fail_deposit: AtomicBool,
    /// Never answer initiate_deposit.
    pub hang_deposit: AtomicBool,
    pub fail_payout: AtomicBool,
    pub unresolvable: AtomicBool,
    deposits: Mutex<Vec<DepositRequest>>,
    payouts: Mutex<Vec<PayoutRequest>>,
}

impl ScriptedPayments {
    pub fn deposits(&self) -> Vec<DepositRequest> {
        self.deposits.lock().unwrap().clone()
    }

    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.payouts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PaymentGateway for ScriptedPayments {
    async fn initiate_deposit(
        &self,
        request: &DepositRequest,
    ) -> Result<DepositInstructions, PaymentError> {
        if self.hang_deposit.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_deposit.load(Ordering::SeqCst) {
            return Err(PaymentError::Api {
                status: 502,
                message: "gateway unavailable".to_string(),
            });
        }
        self.deposits.lock().unwrap().push(request.clone());
        Ok(DepositInstructions {
            reference: request.reference.clone(),
            checkout_url: Some(format!("https://pay.test/{}", request.reference)),
            external_id: Some(format!("ext-{}", request.reference)),
        })
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt, PaymentError> {
        if self.fail_payout.load(Ordering::SeqCst) {
            return Err(PaymentError::Api {
                status: 400,
                message: "payout declined".to_string(),
            });
        }
        self.payouts.lock().unwrap().push(request.clone());
        Ok(PayoutReceipt {
            reference: request.reference.clone(),
            external_id: Some(format!("ext-{}", request.reference)),
        })
    }

    async fn resolve_account(
        &self,
        bank_code: &str,
        account_number: &str,
    ) -> Result<ResolvedAccount, PaymentError> {
        if self.unresolvable.load(Ordering::SeqCst) {
            return Err(PaymentError::AccountNotResolved(format!(
                "{} at {} not found",
                account_number, bank_code
            )));
        }
        Ok(ResolvedAccount {
            bank_code: bank_code.to_string(),
            account_number: account_number.to_string(),
            account_name: "ADA OBI".to_string(),
        })
    }
}

// ==================== Faulty storage ====================

/// FaultyStorage delegates to SQLite and injects failures on demand.
pub struct FaultyStorage {
    inner: Arc<SqliteStorage>,
    fail_order_inserts: AtomicBool,
    forced_conflicts: AtomicU32,
}

impl FaultyStorage {
    pub fn new(inner: Arc<SqliteStorage>) -> Self {
        Self {
            inner,
            fail_order_inserts: AtomicBool::new(false),
            forced_conflicts: AtomicU32::new(0),
        }
    }

    /// Every later order insert fails with a database error.
    pub fn fail_order_inserts(&self) {
        self.fail_order_inserts.store(true, Ordering::SeqCst);
    }

    /// The next `n` fill applications report a version conflict without
    /// writing anything.
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderStore for FaultyStorage {
    async fn insert_order(&self, order: &Order) -> Result<(), StorageError> {
        if self.fail_order_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert_order(order).await
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StorageError> {
        self.inner.get_order(id).await
    }

    async fn reserve_capacity(
        &self,
        order_id: &str,
        amount: Decimal,
        awaiting: &Awaiting,
    ) -> Result<ReserveOutcome, StorageError> {
        self.inner.reserve_capacity(order_id, amount, awaiting).await
    }

    async fn release_reservation(
        &self,
        awaiting_id: &str,
        from: AwaitingStatus,
        amount: Decimal,
    ) -> Result<bool, StorageError> {
        self.inner.release_reservation(awaiting_id, from, amount).await
    }

    async fn apply_fill(&self, update: &FillUpdate) -> Result<FillApply, StorageError> {
        if self.take_conflict() {
            return Ok(FillApply::VersionConflict);
        }
        self.inner.apply_fill(update).await
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        expected_version: i64,
    ) -> Result<bool, StorageError> {
        self.inner.cancel_order(order_id, expected_version).await
    }

    async fn list_fills(&self, order_id: &str) -> Result<Vec<FillRecord>, StorageError> {
        self.inner.list_fills(order_id).await
    }
}

#[async_trait]
impl AwaitingStore for FaultyStorage {
    async fn get_awaiting(&self, id: &str) -> Result<Option<Awaiting>, StorageError> {
        self.inner.get_awaiting(id).await
    }

    async fn transition_awaiting(
        &self,
        id: &str,
        from: AwaitingStatus,
        to: AwaitingStatus,
        reason: Option<&str>,
    ) -> Result<bool, StorageError> {
        self.inner.transition_awaiting(id, from, to, reason).await
    }

    async fn claim_awaiting(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.claim_awaiting(id).await
    }

    async fn find_pending_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Awaiting>, StorageError> {
        self.inner.find_pending_by_address(address).await
    }

    async fn find_pending_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Awaiting>, StorageError> {
        self.inner.find_pending_by_payment_reference(reference).await
    }

    async fn record_shortfall(&self, id: &str, shortfall: Decimal) -> Result<(), StorageError> {
        self.inner.record_shortfall(id, shortfall).await
    }

    async fn assign_awaiting_user(&self, id: &str, user_id: &str) -> Result<bool, StorageError> {
        self.inner.assign_awaiting_user(id, user_id).await
    }

    async fn count_active_awaitings(&self, order_id: &str) -> Result<i64, StorageError> {
        self.inner.count_active_awaitings(order_id).await
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Awaiting>, StorageError> {
        self.inner.list_stale_pending(created_before, limit).await
    }
}

#[async_trait]
impl WalletStore for FaultyStorage {
    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<(), StorageError> {
        self.inner.upsert_wallet(wallet).await
    }

    async fn get_wallet(&self, id: &str) -> Result<Option<Wallet>, StorageError> {
        self.inner.get_wallet(id).await
    }

    async fn find_wallet_by_address(&self, address: &str) -> Result<Option<Wallet>, StorageError> {
        self.inner.find_wallet_by_address(address).await
    }

    async fn find_wallet_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Wallet>, StorageError> {
        self.inner.find_wallet_by_subscription(subscription_id).await
    }

    async fn update_balances(
        &self,
        id: &str,
        account: Decimal,
        available: Decimal,
    ) -> Result<BalanceChange, StorageError> {
        self.inner.update_balances(id, account, available).await
    }
}

#[async_trait]
impl TransactionStore for FaultyStorage {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, StorageError> {
        self.inner.insert_transaction(tx).await
    }

    async fn find_transaction(
        &self,
        reference: &str,
        wallet_id: &str,
    ) -> Result<Option<Transaction>, StorageError> {
        self.inner.find_transaction(reference, wallet_id).await
    }

    async fn find_transactions_by_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<Transaction>, StorageError> {
        self.inner.find_transactions_by_reference(reference).await
    }

    async fn transition_transaction(
        &self,
        reference: &str,
        wallet_id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool, StorageError> {
        self.inner
            .transition_transaction(reference, wallet_id, from, to)
            .await
    }

    async fn fail_pending_transactions(&self, awaiting_id: &str) -> Result<u64, StorageError> {
        self.inner.fail_pending_transactions(awaiting_id).await
    }
}

#[async_trait]
impl RetryStore for FaultyStorage {
    async fn enqueue_retry(
        &self,
        awaiting_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .enqueue_retry(awaiting_id, next_attempt_at, last_error)
            .await
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryEntry>, StorageError> {
        self.inner.due_retries(now, limit).await
    }

    async fn reschedule_retry(
        &self,
        awaiting_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<u32, StorageError> {
        self.inner
            .reschedule_retry(awaiting_id, next_attempt_at, last_error)
            .await
    }

    async fn remove_retry(&self, awaiting_id: &str) -> Result<(), StorageError> {
        self.inner.remove_retry(awaiting_id).await
    }
}

#[async_trait]
impl ReconciliationStore for FaultyStorage {
    async fn record_gap(&self, gap: &ReconciliationGap) -> Result<(), StorageError> {
        self.inner.record_gap(gap).await
    }

    async fn list_gaps(&self) -> Result<Vec<ReconciliationGap>, StorageError> {
        self.inner.list_gaps().await
    }
}

// ==================== Harness ====================

/// Knobs for [`Harness::build`].
#[derive(Default)]
pub struct HarnessOptions {
    pub settlement: Option<SettlementConfig>,
    /// Replaces the manual scheduler in the reservation manager.
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub webhooks: WebhookConfig,
    pub operational_wallet_id: Option<String>,
}

/// Harness wires the real components over in-memory backends.
pub struct Harness {
    pub storage: Arc<SqliteStorage>,
    /// The storage every component is wired to; wraps `storage`.
    pub faults: Arc<FaultyStorage>,
    pub custody: Arc<InMemoryLedger>,
    pub ledger: Arc<LedgerGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub scheduler: Arc<ManualScheduler>,
    pub payments: Arc<ScriptedPayments>,
    pub counters: Arc<Counters>,
    pub reservations: Arc<ReservationManager>,
    pub engine: Arc<SettlementEngine>,
    pub pipeline: EventPipeline,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(HarnessOptions::default()).await
    }

    pub async fn build(options: HarnessOptions) -> Self {
        let storage = Arc::new(
            SqliteStorage::new(SqliteStorageConfig::in_memory())
                .await
                .unwrap(),
        );
        let faults = Arc::new(FaultyStorage::new(storage.clone()));
        let dyn_storage: Arc<dyn Storage> = faults.clone();
        let custody = Arc::new(InMemoryLedger::new());
        let ledger = Arc::new(LedgerGateway::new(
            custody.clone() as Arc<dyn CustodyLedger>,
            dyn_storage.clone(),
            retry_config(),
        ));
        let catalog = Arc::new(catalog());
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let payments = Arc::new(ScriptedPayments::default());
        let counters = Arc::new(Counters::new());
        let settlement = options.settlement.unwrap_or_else(settlement_config);

        let reservations = Arc::new(ReservationManager::new(
            dyn_storage.clone(),
            catalog.clone(),
            Some(payments.clone() as Arc<dyn PaymentGateway>),
            options
                .scheduler
                .unwrap_or_else(|| scheduler.clone() as Arc<dyn Scheduler>),
            notifier.clone(),
            settlement.reservation_ttl(),
            Duration::from_millis(200),
        ));
        let engine = Arc::new(SettlementEngine::new(
            dyn_storage.clone(),
            ledger.clone(),
            catalog.clone(),
            reservations.clone(),
            Some(payments.clone() as Arc<dyn PaymentGateway>),
            notifier.clone(),
            counters.clone(),
            settlement,
        ));
        let pipeline = EventPipeline::new(
            dyn_storage,
            ledger.clone(),
            catalog,
            reservations.clone(),
            engine.clone(),
            notifier.clone(),
            counters.clone(),
            options.webhooks,
            options.operational_wallet_id,
        );

        Self {
            storage,
            faults,
            custody,
            ledger,
            notifier,
            scheduler,
            payments,
            counters,
            reservations,
            engine,
            pipeline,
        }
    }

    /// Stores a wallet in the cache.
    pub async fn wallet(&self, id: &str, user_id: Option<&str>, currency: &str) -> Wallet {
        let wallet = Wallet::new(id, user_id.map(str::to_string), currency);
        self.storage.upsert_wallet(&wallet).await.unwrap();
        wallet
    }

    /// Stores a deposit wallet watched at `address`.
    pub async fn deposit_wallet(&self, id: &str, currency: &str, address: &str) -> Wallet {
        let wallet = Wallet::new(id, None, currency)
            .with_deposit_address(address)
            .with_subscription_id(format!("sub-{}", id));
        self.storage.upsert_wallet(&wallet).await.unwrap();
        wallet
    }

    /// Mints funds straight into a wallet.
    pub async fn fund(&self, wallet: &Wallet, amount: &str) {
        let reference = format!("seed_{}", uuid::Uuid::new_v4().simple());
        self.ledger
            .credit(wallet, d(amount), Posting::new(&reference, TransactionKind::Deposit))
            .await
            .unwrap();
    }

    /// Adds funds at the custody provider without telling the cache, the
    /// way an on-chain deposit lands before its push event.
    pub async fn land(&self, wallet: &Wallet, amount: &str) {
        let reference = format!("chain_{}", uuid::Uuid::new_v4().simple());
        self.custody
            .credit(&wallet.id, d(amount), &reference)
            .await
            .unwrap();
    }

    /// Creates the owner and filler wallets used by the builders above and
    /// funds the filler's NGN wallet.
    pub async fn parties(&self, filler_ngn: &str) {
        self.wallet("owner-btc", Some("owner"), "BTC").await;
        self.wallet("owner-ngn", Some("owner"), "NGN").await;
        self.wallet("filler-btc", Some("filler"), "BTC").await;
        let payer = self.wallet("filler-ngn", Some("filler"), "NGN").await;
        if d(filler_ngn) > Decimal::ZERO {
            self.fund(&payer, filler_ngn).await;
        }
    }

    /// Places a SELL BTC/NGN order of `amount` BTC for the owner, funding the
    /// owner with exactly that amount first.
    pub async fn sell_order(&self, amount: &str, price: &str, minimum: &str) -> Order {
        let owner = self
            .storage
            .get_wallet("owner-btc")
            .await
            .unwrap()
            .expect("call parties() first");
        self.fund(&owner, amount).await;

        self.engine
            .place_order(&OrderRequest {
                user_id: "owner".to_string(),
                base_currency: "BTC".to_string(),
                quote_currency: "NGN".to_string(),
                order_type: OrderType::Sell,
                amount: d(amount),
                price: d(price),
                minimum: Some(d(minimum)),
                wallet_id: "owner-btc".to_string(),
                proceeds_wallet_id: "owner-ngn".to_string(),
            })
            .await
            .unwrap()
    }
}
