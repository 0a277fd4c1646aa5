//! Tests for SQLite storage.

use super::*;
use crate::domain::{
    AwaitingStatus, FillRecord, OrderStatus, OrderType, ReconciliationGap, Transaction,
    TransactionKind, TransactionStatus, TransactionType, Wallet,
};
use crate::storage::{
    AwaitingStore, FillApply, FillUpdate, OrderStore, ReconciliationStore, ReserveOutcome,
    RetryStore, TransactionStore, WalletStore,
};
use crate::testkit;
use chrono::{Duration as ChronoDuration, Utc};
use std::str::FromStr;

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn storage_with_order(amount: &str) -> (SqliteStorage, crate::domain::Order) {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let order = testkit::order(OrderType::Sell, d(amount), d("1500"), d("5"));
    storage.insert_order(&order).await.unwrap();
    (storage, order)
}

fn fill_update(order: &crate::domain::Order, awaiting_id: &str, amount: &str) -> FillUpdate {
    FillUpdate {
        order_id: order.id.clone(),
        awaiting_id: awaiting_id.to_string(),
        expected_version: order.version,
        order_amount: d(amount),
        percentage_processed: d("10.00"),
        status: OrderStatus::Open,
        record: FillRecord {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            awaiting_id: awaiting_id.to_string(),
            fill_amount: d(amount) * order.price,
            order_amount: d(amount),
            price: order.price,
            version: order.version + 1,
            created_at: Utc::now(),
        },
    }
}

// ==================== Order tests ====================

#[tokio::test]
async fn test_insert_and_get_order() {
    let (storage, order) = storage_with_order("100").await;

    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount, d("100"));
    assert_eq!(loaded.price, d("1500"));
    assert_eq!(loaded.status, OrderStatus::Open);
    assert_eq!(loaded.version, 0);
    assert_eq!(loaded.order_type, OrderType::Sell);
}

#[tokio::test]
async fn test_get_order_missing() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    assert!(storage.get_order("nope").await.unwrap().is_none());
}

// ==================== Reservation tests ====================

#[tokio::test]
async fn test_reserve_capacity_increments_reserved() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));

    let outcome = storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();
    assert_eq!(outcome, ReserveOutcome::Reserved);

    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_reserved, d("10"));
    assert!(storage.get_awaiting(&awaiting.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reserve_capacity_rejects_overbooking() {
    let (storage, order) = storage_with_order("100").await;
    let first = testkit::awaiting(&order, d("15000"), d("10"));
    let second = testkit::awaiting(&order, d("142500"), d("95"));

    storage
        .reserve_capacity(&order.id, d("10"), &first)
        .await
        .unwrap();
    let outcome = storage
        .reserve_capacity(&order.id, d("95"), &second)
        .await
        .unwrap();

    assert_eq!(outcome, ReserveOutcome::Unavailable);
    assert!(storage.get_awaiting(&second.id).await.unwrap().is_none());
    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_reserved, d("10"));
}

#[tokio::test]
async fn test_reserve_capacity_exact_remaining() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("150000"), d("100"));

    let outcome = storage
        .reserve_capacity(&order.id, d("100"), &awaiting)
        .await
        .unwrap();
    assert_eq!(outcome, ReserveOutcome::Reserved);
}

#[tokio::test]
async fn test_reserve_capacity_address_busy() {
    let (storage, order) = storage_with_order("100").await;
    let mut first = testkit::awaiting(&order, d("15000"), d("10"));
    first.deposit_address = Some("addr-1".to_string());
    let mut second = testkit::awaiting(&order, d("15000"), d("10"));
    second.deposit_address = Some("addr-1".to_string());

    storage
        .reserve_capacity(&order.id, d("10"), &first)
        .await
        .unwrap();
    let outcome = storage
        .reserve_capacity(&order.id, d("10"), &second)
        .await
        .unwrap();

    assert_eq!(outcome, ReserveOutcome::AddressBusy);
    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_reserved, d("10"));
}

#[tokio::test]
async fn test_release_reservation_is_idempotent() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    let first = storage
        .release_reservation(&awaiting.id, AwaitingStatus::Pending, d("10"))
        .await
        .unwrap();
    let second = storage
        .release_reservation(&awaiting.id, AwaitingStatus::Pending, d("10"))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_reserved, Decimal::ZERO);
}

#[tokio::test]
async fn test_release_reservation_never_negative() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    storage
        .release_reservation(&awaiting.id, AwaitingStatus::Pending, d("25"))
        .await
        .unwrap();

    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_reserved, Decimal::ZERO);
}

// ==================== Fill tests ====================

#[tokio::test]
async fn test_apply_fill_updates_totals() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    let result = storage
        .apply_fill(&fill_update(&order, &awaiting.id, "10"))
        .await
        .unwrap();
    assert_eq!(result, FillApply::Applied);

    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_processed, d("10"));
    assert_eq!(loaded.amount_reserved, Decimal::ZERO);
    assert_eq!(loaded.percentage_processed, d("10.00"));
    assert_eq!(loaded.version, 1);

    let fills = storage.list_fills(&order.id).await.unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_amount, d("10"));
}

#[tokio::test]
async fn test_apply_fill_beyond_int64_unit_range() {
    let (storage, order) = storage_with_order("250000000000.12345678").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("150000000000.00000001"));
    assert_eq!(
        storage
            .reserve_capacity(&order.id, d("150000000000.00000001"), &awaiting)
            .await
            .unwrap(),
        ReserveOutcome::Reserved
    );

    let result = storage
        .apply_fill(&fill_update(&order, &awaiting.id, "150000000000.00000001"))
        .await
        .unwrap();
    assert_eq!(result, FillApply::Applied);

    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount, d("250000000000.12345678"));
    assert_eq!(loaded.amount_processed, d("150000000000.00000001"));
    assert_eq!(loaded.amount_reserved, Decimal::ZERO);
    assert_eq!(
        loaded.amount - loaded.amount_processed,
        d("100000000000.12345677")
    );
}

#[tokio::test]
async fn test_apply_fill_stale_version_conflicts() {
    let (storage, order) = storage_with_order("100").await;
    let a = testkit::awaiting(&order, d("15000"), d("10"));
    let b = testkit::awaiting(&order, d("15000"), d("10"));
    storage.reserve_capacity(&order.id, d("10"), &a).await.unwrap();
    storage.reserve_capacity(&order.id, d("10"), &b).await.unwrap();

    assert_eq!(
        storage.apply_fill(&fill_update(&order, &a.id, "10")).await.unwrap(),
        FillApply::Applied
    );
    // Same expected version as the first fill.
    assert_eq!(
        storage.apply_fill(&fill_update(&order, &b.id, "10")).await.unwrap(),
        FillApply::VersionConflict
    );

    // The conflicting attempt left nothing behind.
    let awaiting = storage.get_awaiting(&b.id).await.unwrap().unwrap();
    assert!(!awaiting.fill_applied);
    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_processed, d("10"));
    assert_eq!(loaded.amount_reserved, d("10"));
}

#[tokio::test]
async fn test_apply_fill_only_once() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    storage
        .apply_fill(&fill_update(&order, &awaiting.id, "10"))
        .await
        .unwrap();
    let mut retry = fill_update(&order, &awaiting.id, "10");
    retry.expected_version = 1;

    assert_eq!(
        storage.apply_fill(&retry).await.unwrap(),
        FillApply::AlreadyApplied
    );
    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.amount_processed, d("10"));
}

#[tokio::test]
async fn test_release_after_fill_is_noop() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();
    storage.claim_awaiting(&awaiting.id).await.unwrap();
    storage
        .apply_fill(&fill_update(&order, &awaiting.id, "10"))
        .await
        .unwrap();

    let released = storage
        .release_reservation(&awaiting.id, AwaitingStatus::Processing, d("10"))
        .await
        .unwrap();
    assert!(!released);
}

// ==================== Cancel tests ====================

#[tokio::test]
async fn test_cancel_order_requires_no_active_awaitings() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    assert!(!storage.cancel_order(&order.id, 0).await.unwrap());

    storage
        .release_reservation(&awaiting.id, AwaitingStatus::Pending, d("10"))
        .await
        .unwrap();
    storage
        .transition_awaiting(&awaiting.id, AwaitingStatus::Pending, AwaitingStatus::Failed, None)
        .await
        .unwrap();

    assert!(storage.cancel_order(&order.id, 0).await.unwrap());
    let loaded = storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, OrderStatus::Canceled);
    assert_eq!(loaded.version, 1);
}

#[tokio::test]
async fn test_cancel_order_stale_version() {
    let (storage, order) = storage_with_order("100").await;
    assert!(!storage.cancel_order(&order.id, 7).await.unwrap());
}

// ==================== Awaiting tests ====================

#[tokio::test]
async fn test_claim_awaiting_once() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    assert!(storage.claim_awaiting(&awaiting.id).await.unwrap());
    assert!(!storage.claim_awaiting(&awaiting.id).await.unwrap());
}

#[tokio::test]
async fn test_claim_awaiting_after_release_fails() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();
    storage
        .release_reservation(&awaiting.id, AwaitingStatus::Pending, d("10"))
        .await
        .unwrap();

    assert!(!storage.claim_awaiting(&awaiting.id).await.unwrap());
}

#[tokio::test]
async fn test_transition_awaiting_rejects_backwards_move() {
    let (storage, order) = storage_with_order("100").await;
    let awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    let result = storage
        .transition_awaiting(&awaiting.id, AwaitingStatus::Success, AwaitingStatus::Pending, None)
        .await;
    assert!(matches!(result, Err(StorageError::InvalidData(_))));
}

#[tokio::test]
async fn test_find_pending_by_address_and_stale() {
    let (storage, order) = storage_with_order("100").await;
    let mut awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    awaiting.deposit_address = Some("addr-9".to_string());
    awaiting.created_at = Utc::now() - ChronoDuration::minutes(45);
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    let found = storage.find_pending_by_address("addr-9").await.unwrap();
    assert_eq!(found.unwrap().id, awaiting.id);

    let stale = storage
        .list_stale_pending(Utc::now() - ChronoDuration::minutes(30), 10)
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(storage.count_active_awaitings(&order.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_assign_awaiting_user_only_when_unset() {
    let (storage, order) = storage_with_order("100").await;
    let mut awaiting = testkit::awaiting(&order, d("15000"), d("10"));
    awaiting.user_id = None;
    storage
        .reserve_capacity(&order.id, d("10"), &awaiting)
        .await
        .unwrap();

    assert!(storage.assign_awaiting_user(&awaiting.id, "u1").await.unwrap());
    assert!(!storage.assign_awaiting_user(&awaiting.id, "u2").await.unwrap());
    let loaded = storage.get_awaiting(&awaiting.id).await.unwrap().unwrap();
    assert_eq!(loaded.user_id.as_deref(), Some("u1"));
}

// ==================== Wallet tests ====================

#[tokio::test]
async fn test_update_balances_returns_change() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let wallet = Wallet::new("w1", Some("u1".to_string()), "BTC").with_deposit_address("addr");
    storage.upsert_wallet(&wallet).await.unwrap();

    let change = storage
        .update_balances("w1", d("1.5"), d("1.2"))
        .await
        .unwrap();
    assert_eq!(change.previous_account, Decimal::ZERO);
    assert_eq!(change.delta(), d("1.5"));

    let by_address = storage.find_wallet_by_address("addr").await.unwrap().unwrap();
    assert_eq!(by_address.available_balance, d("1.2"));
}

#[tokio::test]
async fn test_update_balances_unknown_wallet() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let result = storage.update_balances("missing", d("1"), d("1")).await;
    assert!(matches!(result, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn test_update_balances_large_fiat_amount() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    storage
        .upsert_wallet(&Wallet::new("ngn", Some("u1".to_string()), "NGN"))
        .await
        .unwrap();

    storage
        .update_balances("ngn", d("100000000000"), d("100000000000"))
        .await
        .unwrap();
    let change = storage
        .update_balances("ngn", d("92233720368547758.08"), d("92233720368547758.08"))
        .await
        .unwrap();
    assert_eq!(change.previous_account, d("100000000000"));

    let wallet = storage.get_wallet("ngn").await.unwrap().unwrap();
    assert_eq!(wallet.account_balance, d("92233720368547758.08"));
    assert_eq!(wallet.available_balance.to_string(), "92233720368547758.08");
}

// ==================== Transaction tests ====================

#[tokio::test]
async fn test_insert_transaction_dedups_on_reference_and_wallet() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let tx = Transaction::new(
        "evt-1",
        "w1",
        d("0.5"),
        "BTC",
        TransactionType::Credit,
        TransactionKind::Deposit,
    );
    let duplicate = Transaction::new(
        "evt-1",
        "w1",
        d("0.5"),
        "BTC",
        TransactionType::Credit,
        TransactionKind::Deposit,
    );

    assert!(storage.insert_transaction(&tx).await.unwrap());
    assert!(!storage.insert_transaction(&duplicate).await.unwrap());
    assert_eq!(
        storage
            .find_transactions_by_reference("evt-1")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_transition_and_fail_pending_transactions() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let tx = Transaction::new(
        "dep_a1",
        "w1",
        d("15000"),
        "NGN",
        TransactionType::Credit,
        TransactionKind::Deposit,
    )
    .with_status(TransactionStatus::Pending)
    .with_awaiting("a1");
    storage.insert_transaction(&tx).await.unwrap();

    assert_eq!(storage.fail_pending_transactions("a1").await.unwrap(), 1);
    assert!(!storage
        .transition_transaction(
            "dep_a1",
            "w1",
            TransactionStatus::Pending,
            TransactionStatus::Success
        )
        .await
        .unwrap());
    let loaded = storage.find_transaction("dep_a1", "w1").await.unwrap().unwrap();
    assert_eq!(loaded.status, TransactionStatus::Failed);
}

// ==================== Retry queue tests ====================

#[tokio::test]
async fn test_retry_queue_lifecycle() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let now = Utc::now();

    storage.enqueue_retry("a1", now, "version conflict").await.unwrap();
    storage
        .enqueue_retry("a2", now + ChronoDuration::minutes(5), "version conflict")
        .await
        .unwrap();

    let due = storage.due_retries(now, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].awaiting_id, "a1");
    assert_eq!(due[0].attempts, 0);

    let attempts = storage
        .reschedule_retry("a1", now + ChronoDuration::seconds(2), "again")
        .await
        .unwrap();
    assert_eq!(attempts, 1);
    assert!(storage.due_retries(now, 10).await.unwrap().is_empty());

    storage.remove_retry("a1").await.unwrap();
    let later = storage
        .due_retries(now + ChronoDuration::hours(1), 10)
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].awaiting_id, "a2");
}

#[tokio::test]
async fn test_record_and_list_gaps() {
    let storage = SqliteStorage::new(SqliteStorageConfig::in_memory())
        .await
        .unwrap();
    let gap = ReconciliationGap {
        id: "g1".to_string(),
        order_id: "o1".to_string(),
        awaiting_id: Some("a1".to_string()),
        leg: "payment_transfer".to_string(),
        amount: d("15000"),
        currency: "NGN".to_string(),
        error: "ledger unavailable".to_string(),
        created_at: Utc::now(),
    };
    storage.record_gap(&gap).await.unwrap();

    let gaps = storage.list_gaps().await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].leg, "payment_transfer");
    assert_eq!(gaps[0].amount, d("15000"));
}
