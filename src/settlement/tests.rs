//! Tests for order placement, fill settlement and the retry queue.

use super::*;
use crate::domain::{AwaitingStatus, Funding, OrderType, RejectReason};
use crate::ledger::FailureMode;
use crate::reservation::FillRequest;
use crate::service::Counter;
use crate::storage::{AwaitingStore, OrderStore, ReconciliationStore, RetryStore, WalletStore};
use crate::testkit::{Harness, HarnessOptions, d, settlement_config};
use std::collections::HashMap;

fn fill(order_id: &str, amount: &str) -> FillRequest {
    FillRequest::new(order_id, d(amount), Funding::Wallet, "filler-ngn", "filler-btc")
        .with_user("filler")
}

async fn reserve(h: &Harness, order_id: &str, amount: &str) -> String {
    h.reservations
        .reserve_slot(&fill(order_id, amount))
        .await
        .unwrap()
        .awaiting_id()
        .to_string()
}

fn settled(outcome: SettleOutcome) -> FillSummary {
    match outcome {
        SettleOutcome::Settled(summary) => summary,
        SettleOutcome::Queued => panic!("fill was queued"),
    }
}

fn rejection_reason(result: Result<impl std::fmt::Debug>) -> RejectReason {
    result.unwrap_err().reason().expect("expected a rejection")
}

fn sell_request(amount: &str) -> OrderRequest {
    OrderRequest {
        user_id: "owner".to_string(),
        base_currency: "BTC".to_string(),
        quote_currency: "NGN".to_string(),
        order_type: OrderType::Sell,
        amount: d(amount),
        price: d("1500"),
        minimum: None,
        wallet_id: "owner-btc".to_string(),
        proceeds_wallet_id: "owner-ngn".to_string(),
    }
}

// ==================== Placement tests ====================

#[tokio::test]
async fn test_place_order_escrows_amount() {
    let h = Harness::new().await;
    h.parties("0").await;
    let order = h.sell_order("100", "1500", "5").await;

    assert_eq!(order.status, OrderStatus::Open);
    assert_eq!(order.version, 0);
    assert_eq!(order.amount, d("100"));
    assert_eq!(order.fee, Decimal::ZERO);
    assert_eq!(order.amount_minimum, d("5"));
    assert_eq!(h.custody.hold_remaining(&order.escrow_hold_id).await, Some(d("100")));
    assert_eq!(h.ledger.available("owner-btc").await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn test_place_order_charges_fee() {
    let mut settlement = settlement_config();
    settlement.fee_rate = Some(d("0.01"));
    settlement.fee_wallets = HashMap::from([("BTC".to_string(), "fees-btc".to_string())]);
    let h = Harness::build(HarnessOptions {
        settlement: Some(settlement),
        ..HarnessOptions::default()
    })
    .await;
    h.parties("0").await;
    let order = h.sell_order("100", "1500", "5").await;

    assert_eq!(order.fee, d("1"));
    assert_eq!(order.amount, d("99"));
    assert_eq!(h.custody.hold_remaining(&order.escrow_hold_id).await, Some(d("99")));
    assert_eq!(h.ledger.available("fees-btc").await.unwrap(), d("1"));
}

#[tokio::test]
async fn test_place_order_fee_failure_releases_escrow() {
    let mut settlement = settlement_config();
    settlement.fee_rate = Some(d("0.01"));
    settlement.fee_wallets = HashMap::from([("BTC".to_string(), "fees-btc".to_string())]);
    let h = Harness::build(HarnessOptions {
        settlement: Some(settlement),
        ..HarnessOptions::default()
    })
    .await;
    h.parties("0").await;
    let owner = h.storage.get_wallet("owner-btc").await.unwrap().unwrap();
    h.fund(&owner, "100").await;
    h.custody.fail_next("transfer", FailureMode::Reject).await;

    let result = h.engine.place_order(&sell_request("100")).await;

    assert!(matches!(result, Err(SettlementError::Ledger(_))));
    assert_eq!(h.ledger.available("owner-btc").await.unwrap(), d("100"));
}

#[tokio::test]
async fn test_place_order_insert_failure_returns_escrow_and_fee() {
    let mut settlement = settlement_config();
    settlement.fee_rate = Some(d("0.01"));
    settlement.fee_wallets = HashMap::from([("BTC".to_string(), "fees-btc".to_string())]);
    let h = Harness::build(HarnessOptions {
        settlement: Some(settlement),
        ..HarnessOptions::default()
    })
    .await;
    h.parties("0").await;
    let owner = h.storage.get_wallet("owner-btc").await.unwrap().unwrap();
    h.fund(&owner, "100").await;
    h.faults.fail_order_inserts();

    let result = h.engine.place_order(&sell_request("100")).await;

    assert!(matches!(result, Err(SettlementError::Storage(_))));
    assert_eq!(h.ledger.available("owner-btc").await.unwrap(), d("100"));
    assert_eq!(h.ledger.available("fees-btc").await.unwrap(), Decimal::ZERO);
    assert!(h.storage.list_gaps().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_place_order_insert_failure_with_stuck_hold_records_gap() {
    let h = Harness::new().await;
    h.parties("0").await;
    let owner = h.storage.get_wallet("owner-btc").await.unwrap().unwrap();
    h.fund(&owner, "100").await;
    h.faults.fail_order_inserts();
    h.custody.fail_next("release_escrow", FailureMode::Reject).await;

    let result = h.engine.place_order(&sell_request("100")).await;

    assert!(matches!(result, Err(SettlementError::Storage(_))));
    let gaps = h.storage.list_gaps().await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].leg, "escrow_release");
    assert_eq!(gaps[0].amount, d("100"));
    assert_eq!(gaps[0].currency, "BTC");
    assert_eq!(h.counters.get(Counter::ReconciliationGap), 1);
}

#[tokio::test]
async fn test_place_order_below_catalog_minimum() {
    let h = Harness::new().await;
    h.parties("0").await;
    let owner = h.storage.get_wallet("owner-btc").await.unwrap().unwrap();
    h.fund(&owner, "1").await;

    let result = h.engine.place_order(&sell_request("0.00005")).await;
    assert_eq!(rejection_reason(result), RejectReason::BelowMinimum);
}

#[tokio::test]
async fn test_place_order_insufficient_balance() {
    let h = Harness::new().await;
    h.parties("0").await;
    let owner = h.storage.get_wallet("owner-btc").await.unwrap().unwrap();
    h.fund(&owner, "50").await;

    let err = h.engine.place_order(&sell_request("100")).await.unwrap_err();
    let SettlementError::Rejected(rejection) = err else {
        panic!("expected a rejection");
    };
    assert_eq!(rejection.reason, RejectReason::InsufficientBalance);
    assert_eq!(rejection.available_amount, Some(d("50")));
}

#[tokio::test]
async fn test_place_order_unknown_currency() {
    let h = Harness::new().await;
    h.parties("0").await;
    let mut request = sell_request("1");
    request.quote_currency = "XYZ".to_string();

    let result = h.engine.place_order(&request).await;
    assert_eq!(rejection_reason(result), RejectReason::UnknownCurrency);
}

#[tokio::test]
async fn test_place_order_rejects_foreign_wallet() {
    let h = Harness::new().await;
    h.parties("0").await;
    let mut request = sell_request("1");
    request.wallet_id = "filler-btc".to_string();

    let result = h.engine.place_order(&request).await;
    assert_eq!(rejection_reason(result), RejectReason::InvalidWallet);
}

// ==================== Settlement tests ====================

#[tokio::test]
async fn test_settle_partial_fill() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;

    let summary = settled(h.engine.settle_fill(&awaiting_id).await.unwrap());

    assert_eq!(summary.order_amount, d("10"));
    assert_eq!(summary.amount_processed, d("10"));
    assert_eq!(summary.percentage_processed, d("10.00"));
    assert_eq!(summary.status, OrderStatus::Open);
    assert!(summary.funds_moved);

    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_processed, d("10"));
    assert_eq!(stored.amount_reserved, Decimal::ZERO);
    assert_eq!(stored.percentage_processed, d("10"));
    assert_eq!(stored.status, OrderStatus::Open);
    assert_eq!(stored.version, 1);

    let awaiting = h.storage.get_awaiting(&awaiting_id).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Success);
    assert!(awaiting.fill_applied);

    assert_eq!(h.ledger.available("filler-btc").await.unwrap(), d("10"));
    assert_eq!(h.ledger.available("owner-ngn").await.unwrap(), d("15000"));
    assert_eq!(h.custody.hold_remaining(&order.escrow_hold_id).await, Some(d("90")));
    assert_eq!(h.notifier.titles_for("owner").len(), 1);
    assert_eq!(h.counters.get(Counter::FillSettled), 1);
}

#[tokio::test]
async fn test_settle_exact_remaining_closes_order() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "150000").await;

    let summary = settled(h.engine.settle_fill(&awaiting_id).await.unwrap());
    assert_eq!(summary.status, OrderStatus::Closed);
    assert_eq!(summary.percentage_processed, d("100"));

    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Closed);
    assert_eq!(stored.amount_processed, d("100"));
    assert_eq!(stored.amount_reserved, Decimal::ZERO);
}

#[tokio::test]
async fn test_settle_twice_is_rejected() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;

    settled(h.engine.settle_fill(&awaiting_id).await.unwrap());
    let again = h.engine.settle_fill(&awaiting_id).await;

    assert_eq!(rejection_reason(again), RejectReason::InvalidState);
    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_processed, d("10"));
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_settle_unknown_awaiting() {
    let h = Harness::new().await;
    let result = h.engine.settle_fill("missing").await;
    assert_eq!(rejection_reason(result), RejectReason::AwaitingNotFound);
}

#[tokio::test]
async fn test_settle_insufficient_payer_balance_fails_and_releases() {
    let h = Harness::new().await;
    h.parties("100").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;

    let result = h.engine.settle_fill(&awaiting_id).await;
    assert_eq!(rejection_reason(result), RejectReason::InsufficientBalance);

    let awaiting = h.storage.get_awaiting(&awaiting_id).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Failed);
    assert!(awaiting.reservation_released);
    assert!(!awaiting.fill_applied);

    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_reserved, Decimal::ZERO);
    assert_eq!(stored.amount_processed, Decimal::ZERO);
    assert_eq!(stored.version, 0);
}

#[tokio::test]
async fn test_settle_cancels_scheduled_expiry() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    let key = crate::domain::expiry_key(&awaiting_id);
    assert!(h.scheduler.is_scheduled(&key));

    settled(h.engine.settle_fill(&awaiting_id).await.unwrap());
    assert!(!h.scheduler.is_scheduled(&key));
}

#[tokio::test]
async fn test_concurrent_settlements_both_apply_once() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let first = reserve(&h, &order.id, "15000").await;
    let second = reserve(&h, &order.id, "15000").await;

    let (a, b) = tokio::join!(h.engine.settle_fill(&first), h.engine.settle_fill(&second));
    let queued = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| matches!(o, SettleOutcome::Queued))
        .count();

    // Anything that lost every in-process retry is settled by the queue.
    for _ in 0..queued * 5 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.engine.drain_retry_queue().await.unwrap();
    }

    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_processed, d("20"));
    assert_eq!(stored.amount_reserved, Decimal::ZERO);
    assert_eq!(stored.version, 2);
    assert_eq!(stored.percentage_processed, d("20"));
    assert_eq!(h.storage.list_fills(&order.id).await.unwrap().len(), 2);

    for id in [&first, &second] {
        let awaiting = h.storage.get_awaiting(id).await.unwrap().unwrap();
        assert_eq!(awaiting.status, AwaitingStatus::Success);
    }
    assert_eq!(h.ledger.available("owner-ngn").await.unwrap(), d("30000"));
}

#[tokio::test]
async fn test_settle_retries_conflicts_in_process() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    h.faults.force_conflicts(2);

    let summary = settled(h.engine.settle_fill(&awaiting_id).await.unwrap());

    assert_eq!(summary.conflicts, 2);
    assert_eq!(summary.version, 1);
    assert_eq!(h.counters.get(Counter::ConflictRetried), 2);
    assert_eq!(h.counters.get(Counter::FillQueued), 0);
    assert_eq!(h.storage.list_fills(&order.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_settle_without_conflict_retries_queues_fill() {
    let mut settlement = settlement_config();
    settlement.conflict_retries = Some(0);
    let h = Harness::build(HarnessOptions {
        settlement: Some(settlement),
        ..HarnessOptions::default()
    })
    .await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    h.faults.force_conflicts(1);

    let outcome = h.engine.settle_fill(&awaiting_id).await.unwrap();

    assert!(matches!(outcome, SettleOutcome::Queued));
    assert_eq!(h.counters.get(Counter::ConflictRetried), 0);
    assert_eq!(h.counters.get(Counter::FillQueued), 1);

    let due = h
        .storage
        .due_retries(chrono::Utc::now() + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].awaiting_id, awaiting_id);
    assert!(due[0].last_error.as_deref().unwrap().contains("version conflict"));

    let awaiting = h.storage.get_awaiting(&awaiting_id).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Processing);
    assert!(!awaiting.fill_applied);
    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 0);
    assert_eq!(stored.amount_reserved, d("10"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_settlements_apply_each_fill_once() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(reserve(&h, &order.id, "15000").await);
    }
    // On top of whatever real contention the workers produce.
    h.faults.force_conflicts(3);

    let mut set = tokio::task::JoinSet::new();
    for id in ids.clone() {
        let engine = h.engine.clone();
        set.spawn(async move { engine.settle_fill(&id).await });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }

    for _ in 0..50 {
        let pending = h
            .storage
            .due_retries(chrono::Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        if pending.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.engine.drain_retry_queue().await.unwrap();
    }

    let stats = h.counters.snapshot();
    assert!(stats.conflicts_retried >= 2);
    assert_eq!(stats.fills_settled, 6);

    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_processed, d("60"));
    assert_eq!(stored.amount_reserved, Decimal::ZERO);
    assert_eq!(stored.version, 6);

    let fills = h.storage.list_fills(&order.id).await.unwrap();
    assert_eq!(fills.len(), 6);
    let versions: Vec<i64> = fills.iter().map(|f| f.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    for id in &ids {
        let awaiting = h.storage.get_awaiting(id).await.unwrap().unwrap();
        assert_eq!(awaiting.status, AwaitingStatus::Success);
        assert_eq!(fills.iter().filter(|f| &f.awaiting_id == id).count(), 1);
    }
    assert_eq!(h.ledger.available("owner-ngn").await.unwrap(), d("90000"));
}

// ==================== Fund leg tests ====================

#[tokio::test]
async fn test_failed_payment_leg_records_gap() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    h.custody.fail_next("transfer", FailureMode::Reject).await;

    let summary = settled(h.engine.settle_fill(&awaiting_id).await.unwrap());
    assert!(!summary.funds_moved);

    // Bookkeeping stands.
    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_processed, d("10"));

    let gaps = h.storage.list_gaps().await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].leg, "payment_transfer");
    assert_eq!(gaps[0].amount, d("15000"));
    assert_eq!(gaps[0].awaiting_id.as_deref(), Some(awaiting_id.as_str()));

    let awaiting = h.storage.get_awaiting(&awaiting_id).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Failed);
    assert!(awaiting.fill_applied);
    assert_eq!(h.counters.get(Counter::ReconciliationGap), 1);
}

#[tokio::test]
async fn test_failed_escrow_leg_skips_payment() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    h.custody.fail_next("settle_escrow", FailureMode::Reject).await;

    let summary = settled(h.engine.settle_fill(&awaiting_id).await.unwrap());
    assert!(!summary.funds_moved);

    let gaps = h.storage.list_gaps().await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].leg, "escrow_settlement");
    assert_eq!(gaps[0].currency, "BTC");
    assert_eq!(h.ledger.available("filler-ngn").await.unwrap(), d("1000000"));
}

// ==================== Payout tests ====================

#[tokio::test]
async fn test_address_delivery_withdraws_proceeds() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let request = fill(&order.id, "15000").with_delivery(crate::domain::DeliveryTarget::Address {
        address: "bc1qfiller".to_string(),
        network: Some("bitcoin".to_string()),
    });
    let slot = h.reservations.reserve_slot(&request).await.unwrap();

    settled(h.engine.settle_fill(slot.awaiting_id()).await.unwrap());

    let awaiting = h.storage.get_awaiting(slot.awaiting_id()).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Success);
    assert_eq!(h.ledger.available("filler-btc").await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn test_bank_payout_failure_marks_awaiting_failed() {
    let h = Harness::new().await;
    // BUY order: owner escrows NGN and receives BTC.
    h.wallet("owner-ngn", Some("owner"), "NGN").await;
    h.wallet("owner-btc", Some("owner"), "BTC").await;
    h.wallet("filler-ngn", Some("filler"), "NGN").await;
    let payer = h.wallet("filler-btc", Some("filler"), "BTC").await;
    h.fund(&payer, "1").await;
    let owner = h.storage.get_wallet("owner-ngn").await.unwrap().unwrap();
    h.fund(&owner, "150000").await;
    let order = h
        .engine
        .place_order(&OrderRequest {
            order_type: OrderType::Buy,
            amount: d("150000"),
            wallet_id: "owner-ngn".to_string(),
            proceeds_wallet_id: "owner-btc".to_string(),
            ..sell_request("0")
        })
        .await
        .unwrap();

    let request = FillRequest::new(&order.id, d("1"), Funding::Wallet, "filler-btc", "filler-ngn")
        .with_user("filler")
        .with_delivery(crate::domain::DeliveryTarget::Bank {
            bank_code: "058".to_string(),
            account_number: "0123456789".to_string(),
            account_name: None,
        });
    let slot = h.reservations.reserve_slot(&request).await.unwrap();
    h.payments
        .fail_payout
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let summary = settled(h.engine.settle_fill(slot.awaiting_id()).await.unwrap());
    assert_eq!(summary.order_amount, d("1500"));

    let awaiting = h.storage.get_awaiting(slot.awaiting_id()).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Failed);
    assert!(awaiting.failure_reason.unwrap().starts_with("payout failed"));
    // The fill stands and the proceeds stay in the receiver wallet.
    assert_eq!(h.ledger.available("filler-ngn").await.unwrap(), d("1500"));
}

// ==================== Cancel tests ====================

#[tokio::test]
async fn test_cancel_order_releases_escrow() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    settled(h.engine.settle_fill(&awaiting_id).await.unwrap());

    let canceled = h.engine.cancel_order(&order.id, "owner").await.unwrap();

    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert_eq!(canceled.version, 2);
    assert_eq!(h.ledger.available("owner-btc").await.unwrap(), d("90"));
}

#[tokio::test]
async fn test_cancel_order_rejects_other_user() {
    let h = Harness::new().await;
    h.parties("0").await;
    let order = h.sell_order("100", "1500", "5").await;

    let result = h.engine.cancel_order(&order.id, "filler").await;
    assert_eq!(rejection_reason(result), RejectReason::NotOwner);
}

#[tokio::test]
async fn test_cancel_order_with_active_fill() {
    let h = Harness::new().await;
    h.parties("0").await;
    let order = h.sell_order("100", "1500", "5").await;
    reserve(&h, &order.id, "15000").await;

    let result = h.engine.cancel_order(&order.id, "owner").await;
    assert_eq!(rejection_reason(result), RejectReason::ActiveFills);

    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Open);
}

#[tokio::test]
async fn test_cancel_canceled_order() {
    let h = Harness::new().await;
    h.parties("0").await;
    let order = h.sell_order("100", "1500", "5").await;
    h.engine.cancel_order(&order.id, "owner").await.unwrap();

    let result = h.engine.cancel_order(&order.id, "owner").await;
    assert_eq!(rejection_reason(result), RejectReason::OrderNotOpen);
}

// ==================== Retry queue tests ====================

#[tokio::test]
async fn test_drain_settles_queued_fill() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    assert!(h.storage.claim_awaiting(&awaiting_id).await.unwrap());
    h.storage
        .enqueue_retry(&awaiting_id, chrono::Utc::now(), "version conflict")
        .await
        .unwrap();

    let report = h.engine.drain_retry_queue().await.unwrap();

    assert_eq!(report.settled, 1);
    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_processed, d("10"));
    assert!(h.storage.due_retries(chrono::Utc::now(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_drain_fails_rejected_fill() {
    let h = Harness::new().await;
    h.parties("0").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    assert!(h.storage.claim_awaiting(&awaiting_id).await.unwrap());
    h.storage
        .enqueue_retry(&awaiting_id, chrono::Utc::now(), "version conflict")
        .await
        .unwrap();

    let report = h.engine.drain_retry_queue().await.unwrap();

    assert_eq!(report.failed, 1);
    let awaiting = h.storage.get_awaiting(&awaiting_id).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Failed);
    let stored = h.storage.get_order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_reserved, Decimal::ZERO);
}

#[tokio::test]
async fn test_drain_drops_settled_entry() {
    let h = Harness::new().await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    settled(h.engine.settle_fill(&awaiting_id).await.unwrap());
    h.storage
        .enqueue_retry(&awaiting_id, chrono::Utc::now(), "stale")
        .await
        .unwrap();

    let report = h.engine.drain_retry_queue().await.unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(report.settled, 0);
}

#[tokio::test]
async fn test_drain_exhausts_attempts() {
    let mut settlement = settlement_config();
    settlement.retry_max_attempts = Some(1);
    let h = Harness::build(HarnessOptions {
        settlement: Some(settlement),
        ..HarnessOptions::default()
    })
    .await;
    h.parties("1000000").await;
    let order = h.sell_order("100", "1500", "5").await;
    let awaiting_id = reserve(&h, &order.id, "15000").await;
    assert!(h.storage.claim_awaiting(&awaiting_id).await.unwrap());
    h.storage
        .enqueue_retry(&awaiting_id, chrono::Utc::now(), "version conflict")
        .await
        .unwrap();
    // A transient ledger outage outlasts the gateway's own retries.
    h.custody.fail_next("balance", FailureMode::Transient).await;
    h.custody.fail_next("balance", FailureMode::Transient).await;

    let report = h.engine.drain_retry_queue().await.unwrap();

    assert_eq!(report.failed, 1);
    let awaiting = h.storage.get_awaiting(&awaiting_id).await.unwrap().unwrap();
    assert_eq!(awaiting.status, AwaitingStatus::Failed);
    assert!(
        awaiting
            .failure_reason
            .unwrap()
            .starts_with("settlement retries exhausted")
    );
}
