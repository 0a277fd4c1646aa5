//! Applying a fill to its order and moving the funds.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{FillSummary, Result, SettleOutcome, SettlementEngine, SettlementError};
use crate::decimal;
use crate::domain::{
    Awaiting, AwaitingStatus, FillRecord, Order, OrderStatus, RejectReason, Rejection,
    TransactionKind, Wallet,
};
use crate::ledger::Posting;
use crate::notification::Notification;
use crate::service::Counter;
use crate::storage::{FillApply, FillUpdate, StorageError};

/// Result of the version-guarded update loop.
pub(super) enum Attempt {
    Applied(Applied),
    /// Still conflicting after the in-process retries.
    Conflicted { conflicts: u32 },
}

pub(super) struct Applied {
    /// Order as read for the winning attempt.
    order: Order,
    update: FillUpdate,
    conflicts: u32,
}

impl SettlementEngine {
    /// Settles a PENDING awaiting against its order.
    ///
    /// Version conflicts are retried in-process and then queued; a queued
    /// fill is reported as [`SettleOutcome::Queued`], not as an error.
    pub async fn settle_fill(&self, awaiting_id: &str) -> Result<SettleOutcome> {
        let awaiting = self
            .storage
            .get_awaiting(awaiting_id)
            .await?
            .ok_or_else(|| {
                SettlementError::rejected(RejectReason::AwaitingNotFound, "awaiting does not exist")
            })?;

        if awaiting.status != AwaitingStatus::Pending {
            return Err(SettlementError::rejected(
                RejectReason::InvalidState,
                format!("awaiting is {}", awaiting.status),
            ));
        }
        if !self.storage.claim_awaiting(awaiting_id).await? {
            return Err(SettlementError::rejected(
                RejectReason::InvalidState,
                "awaiting was claimed or released concurrently",
            ));
        }
        self.reservations.cancel_expiry(awaiting_id);

        let awaiting = Awaiting {
            status: AwaitingStatus::Processing,
            ..awaiting
        };
        debug!(awaiting_id, order_id = %awaiting.order_id, "Awaiting claimed");

        match self.attempt(&awaiting).await {
            Ok(Attempt::Applied(applied)) => {
                Ok(SettleOutcome::Settled(self.complete(&awaiting, applied).await?))
            }
            Ok(Attempt::Conflicted { conflicts }) => {
                let cause = format!("version conflict after {} attempts", conflicts);
                self.defer(&awaiting, &cause).await?;
                Ok(SettleOutcome::Queued)
            }
            Err(SettlementError::Rejected(rejection)) => {
                self.fail_claimed(&awaiting, &rejection.to_string()).await;
                Err(SettlementError::Rejected(rejection))
            }
            Err(e) => {
                // Leaves the claim in place so the queue picks it up again.
                warn!(awaiting_id, error = %e, "Settlement attempt failed, deferring");
                self.defer(&awaiting, &e.to_string()).await?;
                Ok(SettleOutcome::Queued)
            }
        }
    }

    /// Validates and applies the fill, retrying version conflicts with a
    /// fixed delay.
    pub(super) async fn attempt(&self, awaiting: &Awaiting) -> Result<Attempt> {
        let retries = self.config.conflict_retries();
        let mut conflicts = 0;

        loop {
            let order = self
                .storage
                .get_order(&awaiting.order_id)
                .await?
                .ok_or_else(|| {
                    SettlementError::rejected(RejectReason::OrderNotFound, "order does not exist")
                })?;

            let order_amount = self.validate_fill(&order, awaiting).await?;
            let update = fill_update(&order, awaiting, order_amount);

            match self.storage.apply_fill(&update).await? {
                FillApply::Applied => {
                    return Ok(Attempt::Applied(Applied {
                        order,
                        update,
                        conflicts,
                    }));
                }
                FillApply::VersionConflict => {
                    conflicts += 1;
                    if conflicts > retries {
                        warn!(
                            awaiting_id = %awaiting.id,
                            order_id = %order.id,
                            conflicts,
                            "Version conflict persisted"
                        );
                        return Ok(Attempt::Conflicted { conflicts });
                    }
                    self.counters.incr(Counter::ConflictRetried);
                    debug!(
                        awaiting_id = %awaiting.id,
                        order_id = %order.id,
                        version = order.version,
                        attempt = conflicts,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(self.config.conflict_retry_delay()).await;
                }
                FillApply::AlreadyApplied => {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidState,
                        "fill was already applied or its reservation released",
                    ));
                }
            }
        }
    }

    /// Checks the order can absorb the fill and both parties hold the funds.
    /// Returns the fill converted to the order currency.
    async fn validate_fill(&self, order: &Order, awaiting: &Awaiting) -> Result<Decimal> {
        if !order.is_open() {
            return Err(SettlementError::rejected(
                RejectReason::OrderNotOpen,
                format!("order is {}", order.status),
            ));
        }

        let remaining = order.remaining();
        if remaining <= Decimal::ZERO {
            return Err(Rejection::new(
                RejectReason::InsufficientCapacity,
                "order has nothing left to fill",
            )
            .with_available(Decimal::ZERO)
            .into());
        }

        let profile = self.catalog.profile(order.order_currency());
        let order_amount =
            decimal::to_order_currency(awaiting.amount, order.price, order.order_type, &profile)?;
        if decimal::gt(order_amount, remaining) {
            return Err(Rejection::new(
                RejectReason::InsufficientCapacity,
                format!(
                    "fill of {} exceeds remaining {}",
                    order_amount.normalize(),
                    remaining.normalize()
                ),
            )
            .with_available(remaining)
            .into());
        }

        let payer_available = self.ledger.available(&awaiting.payer_wallet_id).await?;
        if payer_available < awaiting.amount {
            return Err(SettlementError::rejected(
                RejectReason::InsufficientBalance,
                format!(
                    "payer holds {} {}, fill needs {}",
                    payer_available.normalize(),
                    awaiting.currency,
                    awaiting.amount.normalize()
                ),
            ));
        }

        let owner = self.ledger.resync(&order.wallet_id).await?;
        if owner.account < order_amount {
            return Err(SettlementError::rejected(
                RejectReason::InsufficientBalance,
                format!(
                    "owner escrow holds {} {}, fill needs {}",
                    owner.account.normalize(),
                    order.order_currency(),
                    order_amount.normalize()
                ),
            ));
        }

        Ok(order_amount)
    }

    /// Moves the funds for an applied fill, then notifies and pays out.
    pub(super) async fn complete(&self, awaiting: &Awaiting, applied: Applied) -> Result<FillSummary> {
        let Applied {
            order,
            update,
            conflicts,
        } = applied;
        let order_amount = update.order_amount;
        let amount_processed = order.amount_processed + order_amount;

        info!(
            order_id = %order.id,
            awaiting_id = %awaiting.id,
            order_amount = %order_amount,
            processed = %amount_processed,
            percentage = %update.percentage_processed,
            status = %update.status,
            version = update.record.version,
            "Fill applied"
        );
        self.counters.incr(Counter::FillSettled);

        let funds_moved = match self.move_funds(&order, awaiting, order_amount).await {
            Ok(()) => true,
            Err(gap) => {
                self.record_gap(
                    &order.id,
                    Some(&awaiting.id),
                    gap.leg,
                    gap.amount,
                    &gap.currency,
                    &gap.cause,
                )
                .await;
                let reason = format!("{} leg failed: {}", gap.leg, gap.cause);
                if let Err(e) = self
                    .storage
                    .transition_awaiting(
                        &awaiting.id,
                        AwaitingStatus::Processing,
                        AwaitingStatus::Failed,
                        Some(&reason),
                    )
                    .await
                {
                    warn!(awaiting_id = %awaiting.id, error = %e, "Failed to mark awaiting failed");
                }
                if let Some(ref user_id) = awaiting.user_id {
                    self.notifier
                        .enqueue(Notification::fill_failed(user_id, &awaiting.id, &reason));
                }
                false
            }
        };

        if update.status == OrderStatus::Closed {
            self.release_dust(&order).await;
        }

        if funds_moved {
            self.notify_fill(&order, awaiting, order_amount, update.percentage_processed);
            self.finish(&order, awaiting, order_amount).await;
        }

        Ok(FillSummary {
            order_id: order.id.clone(),
            awaiting_id: awaiting.id.clone(),
            fill_amount: awaiting.amount,
            fill_currency: awaiting.currency.clone(),
            order_amount,
            order_currency: order.order_currency().to_string(),
            amount_processed,
            percentage_processed: update.percentage_processed,
            status: update.status,
            version: update.record.version,
            conflicts,
            funds_moved,
        })
    }

    /// Draws the escrow to the filler, then moves the filler's payment to the
    /// owner. Nothing is compensated: the first failing leg is returned.
    async fn move_funds(
        &self,
        order: &Order,
        awaiting: &Awaiting,
        order_amount: Decimal,
    ) -> std::result::Result<(), FailedLeg> {
        let escrow_leg = |cause: String| FailedLeg {
            leg: "escrow_settlement",
            amount: order_amount,
            currency: order.order_currency().to_string(),
            cause,
        };
        let payment_leg = |cause: String| FailedLeg {
            leg: "payment_transfer",
            amount: awaiting.amount,
            currency: awaiting.currency.clone(),
            cause,
        };

        let owner = self
            .load_wallet(&order.wallet_id)
            .await
            .map_err(|e| escrow_leg(e.to_string()))?;
        let receiver = self
            .load_wallet(&awaiting.receiver_wallet_id)
            .await
            .map_err(|e| escrow_leg(e.to_string()))?;

        let reference = format!("fill_{}_escrow", awaiting.id);
        let posting =
            Posting::new(&reference, TransactionKind::EscrowSettlement).for_awaiting(&awaiting.id);
        self.ledger
            .settle_escrow(&order.escrow_hold_id, &owner, &receiver, order_amount, posting)
            .await
            .map_err(|e| escrow_leg(e.to_string()))?;

        let payer = self
            .load_wallet(&awaiting.payer_wallet_id)
            .await
            .map_err(|e| payment_leg(e.to_string()))?;
        let proceeds = self
            .load_wallet(&order.proceeds_wallet_id)
            .await
            .map_err(|e| payment_leg(e.to_string()))?;

        let reference = format!("fill_{}_payment", awaiting.id);
        let posting = Posting::new(&reference, TransactionKind::Transfer).for_awaiting(&awaiting.id);
        self.ledger
            .transfer(&payer, &proceeds, awaiting.amount, posting)
            .await
            .map_err(|e| payment_leg(e.to_string()))?;

        Ok(())
    }

    /// Returns what truncation left on the hold of a closed order.
    async fn release_dust(&self, order: &Order) {
        let reference = format!("close_{}", order.id);
        match self
            .ledger
            .release_escrow(&order.escrow_hold_id, &order.wallet_id, &reference)
            .await
        {
            Ok(released) if released > Decimal::ZERO => {
                info!(order_id = %order.id, released = %released, "Escrow dust released");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Failed to release escrow dust");
            }
        }
    }

    fn notify_fill(
        &self,
        order: &Order,
        awaiting: &Awaiting,
        order_amount: Decimal,
        percentage: Decimal,
    ) {
        self.notifier.enqueue(Notification::fill_settled_owner(
            &order.user_id,
            &order.id,
            order_amount,
            order.order_currency(),
            awaiting.amount,
            &awaiting.currency,
            percentage,
        ));

        if let Some(ref user_id) = awaiting.user_id {
            self.notifier.enqueue(Notification::fill_settled_filler(
                user_id,
                awaiting.amount,
                &awaiting.currency,
                order_amount,
                order.order_currency(),
            ));
        }
    }

    /// Fails a claimed awaiting that will never apply and returns its
    /// reservation. Re-reads first so an applied fill is never failed.
    pub(super) async fn fail_claimed(&self, awaiting: &Awaiting, reason: &str) {
        let current = match self.storage.get_awaiting(&awaiting.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(awaiting_id = %awaiting.id, error = %e, "Failed to reload awaiting");
                return;
            }
        };

        match self
            .reservations
            .retire(&current, AwaitingStatus::Failed, reason)
            .await
        {
            Ok(true) => {
                if let Some(ref user_id) = current.user_id {
                    self.notifier
                        .enqueue(Notification::fill_failed(user_id, &current.id, reason));
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(awaiting_id = %awaiting.id, error = %e, "Failed to fail awaiting");
            }
        }
    }

    /// Hands a claimed awaiting to the durable retry queue.
    async fn defer(&self, awaiting: &Awaiting, cause: &str) -> Result<()> {
        let next = Utc::now() + to_chrono(self.config.retry_backoff(1));
        self.storage
            .enqueue_retry(&awaiting.id, next, cause)
            .await?;
        self.counters.incr(Counter::FillQueued);

        warn!(
            awaiting_id = %awaiting.id,
            order_id = %awaiting.order_id,
            next_attempt_at = %next,
            cause,
            "Fill queued for retry"
        );
        Ok(())
    }

    pub(super) async fn load_wallet(&self, wallet_id: &str) -> std::result::Result<Wallet, StorageError> {
        self.storage
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("wallet {}", wallet_id)))
    }
}

/// A fund leg that failed after the bookkeeping committed.
struct FailedLeg {
    leg: &'static str,
    amount: Decimal,
    currency: String,
    cause: String,
}

/// Builds the conditional update for `order_amount` against the order as read.
fn fill_update(order: &Order, awaiting: &Awaiting, order_amount: Decimal) -> FillUpdate {
    let processed = order.amount_processed + order_amount;
    let status = if decimal::gte(processed, order.amount) {
        OrderStatus::Closed
    } else {
        OrderStatus::Open
    };

    FillUpdate {
        order_id: order.id.clone(),
        awaiting_id: awaiting.id.clone(),
        expected_version: order.version,
        order_amount,
        percentage_processed: decimal::percentage(processed, order.amount),
        status,
        record: FillRecord {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            awaiting_id: awaiting.id.clone(),
            fill_amount: awaiting.amount,
            order_amount,
            price: order.price,
            version: order.version + 1,
            created_at: Utc::now(),
        },
    }
}

pub(super) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(300))
}
