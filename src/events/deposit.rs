//! Custody deposit pushes and routing of arrived funds to awaitings.

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::{DepositEvent, EventPipeline, WebhookAck};
use crate::decimal;
use crate::domain::{
    Awaiting, AwaitingStatus, Transaction, TransactionKind, TransactionType, Wallet,
};
use crate::ledger::Posting;
use crate::notification::Notification;
use crate::service::Counter;
use crate::settlement::{Result, SettleOutcome, SettlementError};

/// Where a short deposit can be returned to.
pub(super) struct RefundTarget<'a> {
    pub address: &'a str,
    pub network: Option<&'a str>,
}

/// Reference of the refund returning a short deposit.
fn refund_reference(awaiting_id: &str) -> String {
    format!("refund_{}", awaiting_id)
}

impl EventPipeline {
    /// Handles an authenticated deposit push. Processing errors are logged
    /// and acknowledged as deferred.
    pub async fn handle_deposit_event(&self, event: &DepositEvent) -> WebhookAck {
        let ack = match self.process_deposit(event).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(reference = %event.reference, error = %e, "Deposit event processing failed");
                WebhookAck::Deferred
            }
        };
        self.count(ack);
        ack
    }

    async fn process_deposit(&self, event: &DepositEvent) -> Result<WebhookAck> {
        let Some(wallet) = self.resolve_wallet(event).await? else {
            warn!(
                reference = %event.reference,
                address = event.address.as_deref().unwrap_or("-"),
                "Deposit event for an unknown wallet"
            );
            return Ok(WebhookAck::Ignored);
        };

        if self
            .storage
            .find_transaction(&event.reference, &wallet.id)
            .await?
            .is_some()
        {
            debug!(reference = %event.reference, wallet_id = %wallet.id, "Duplicate deposit event");
            return Ok(WebhookAck::Duplicate);
        }

        let change = self.ledger.resync(&wallet.id).await?;
        let delta = change.delta();

        if delta > Decimal::ZERO {
            self.credit_arrived(event, &wallet, delta, change.available)
                .await
        } else if delta < Decimal::ZERO {
            self.debit_observed(event, &wallet, -delta).await
        } else {
            warn!(
                reference = %event.reference,
                wallet_id = %wallet.id,
                "Deposit event without a balance change"
            );
            Ok(WebhookAck::Ignored)
        }
    }

    async fn resolve_wallet(&self, event: &DepositEvent) -> Result<Option<Wallet>> {
        if let Some(ref subscription_id) = event.subscription_id {
            if let Some(wallet) = self
                .storage
                .find_wallet_by_subscription(subscription_id)
                .await?
            {
                return Ok(Some(wallet));
            }
        }
        match event.address {
            Some(ref address) => Ok(self.storage.find_wallet_by_address(address).await?),
            None => Ok(None),
        }
    }

    async fn credit_arrived(
        &self,
        event: &DepositEvent,
        wallet: &Wallet,
        amount: Decimal,
        available: Decimal,
    ) -> Result<WebhookAck> {
        let tx = Transaction::new(
            &event.reference,
            &wallet.id,
            amount,
            &wallet.currency,
            TransactionType::Credit,
            TransactionKind::Deposit,
        )
        .with_user(wallet.user_id.clone())
        .with_external_id(event.tx_hash.clone());

        if !self.storage.insert_transaction(&tx).await? {
            return Ok(WebhookAck::Duplicate);
        }
        info!(
            reference = %event.reference,
            wallet_id = %wallet.id,
            amount = %amount,
            currency = %wallet.currency,
            "Deposit credited"
        );

        let address = wallet
            .deposit_address
            .as_deref()
            .or(event.address.as_deref());
        let awaiting = match address {
            Some(address) => self.storage.find_pending_by_address(address).await?,
            None => None,
        };

        match awaiting {
            Some(awaiting) => {
                let sender = event.from_address.as_deref().map(|address| RefundTarget {
                    address,
                    network: event.network.as_deref(),
                });
                self.route_to_awaiting(&awaiting, wallet, available, sender)
                    .await
            }
            None => {
                if let Some(ref user_id) = wallet.user_id {
                    self.notifier.enqueue(Notification::deposit_received(
                        user_id,
                        amount,
                        &wallet.currency,
                    ));
                }
                Ok(WebhookAck::Processed)
            }
        }
    }

    async fn debit_observed(
        &self,
        event: &DepositEvent,
        wallet: &Wallet,
        amount: Decimal,
    ) -> Result<WebhookAck> {
        let tx = Transaction::new(
            &event.reference,
            &wallet.id,
            amount,
            &wallet.currency,
            TransactionType::Debit,
            TransactionKind::Withdrawal,
        )
        .with_user(wallet.user_id.clone())
        .with_external_id(event.tx_hash.clone());

        if !self.storage.insert_transaction(&tx).await? {
            return Ok(WebhookAck::Duplicate);
        }
        info!(
            reference = %event.reference,
            wallet_id = %wallet.id,
            amount = %amount,
            "Outgoing movement recorded"
        );

        let operational = self.operational_wallet_id.as_deref() == Some(wallet.id.as_str());
        if !operational {
            if let Some(ref user_id) = wallet.user_id {
                self.notifier.enqueue(Notification::withdrawal_completed(
                    user_id,
                    amount,
                    &wallet.currency,
                ));
            }
        }
        Ok(WebhookAck::Processed)
    }

    /// Settles the awaiting the arrived funds belong to, or refunds them
    /// when they fall short. `available` must come from a fresh resync.
    pub(super) async fn route_to_awaiting(
        &self,
        awaiting: &Awaiting,
        wallet: &Wallet,
        available: Decimal,
        sender: Option<RefundTarget<'_>>,
    ) -> Result<WebhookAck> {
        if !decimal::gte(available, awaiting.amount) {
            self.refund_shortfall(awaiting, wallet, available, sender)
                .await?;
            return Ok(WebhookAck::Processed);
        }

        self.reservations.cancel_expiry(&awaiting.id);
        match self.engine.settle_fill(&awaiting.id).await {
            Ok(SettleOutcome::Settled(summary)) => {
                info!(
                    awaiting_id = %awaiting.id,
                    order_id = %summary.order_id,
                    status = %summary.status,
                    funds_moved = summary.funds_moved,
                    "Deposit settled its awaiting"
                );
                Ok(WebhookAck::Processed)
            }
            Ok(SettleOutcome::Queued) => Ok(WebhookAck::Deferred),
            Err(SettlementError::Rejected(rejection)) => {
                warn!(
                    awaiting_id = %awaiting.id,
                    reason = %rejection.reason,
                    message = %rejection.message,
                    "Deposit could not settle its awaiting"
                );
                Ok(WebhookAck::Processed)
            }
            Err(e) => Err(e),
        }
    }

    /// Records the shortfall, refunds the awaiting and returns what arrived
    /// to the sender when the sender is known.
    async fn refund_shortfall(
        &self,
        awaiting: &Awaiting,
        wallet: &Wallet,
        available: Decimal,
        sender: Option<RefundTarget<'_>>,
    ) -> Result<()> {
        let shortfall = awaiting.amount - available;
        self.storage
            .record_shortfall(&awaiting.id, shortfall)
            .await?;

        let reason = format!(
            "deposit short by {} {}",
            shortfall.normalize(),
            wallet.currency
        );
        if !self
            .reservations
            .retire(awaiting, AwaitingStatus::Refunded, &reason)
            .await?
        {
            return Ok(());
        }
        self.counters.incr(Counter::Refund);
        warn!(
            awaiting_id = %awaiting.id,
            expected = %awaiting.amount,
            available = %available,
            shortfall = %shortfall,
            "Short deposit refunded"
        );

        if available > Decimal::ZERO {
            match sender {
                Some(target) => {
                    let amount = self.catalog.profile(&wallet.currency).to_blockchain(available);
                    let reference = refund_reference(&awaiting.id);
                    let posting = Posting::new(&reference, TransactionKind::Refund)
                        .for_awaiting(&awaiting.id);
                    if let Err(e) = self
                        .ledger
                        .withdraw(wallet, amount, target.address, target.network, posting)
                        .await
                    {
                        error!(
                            awaiting_id = %awaiting.id,
                            address = target.address,
                            amount = %amount,
                            error = %e,
                            "Refund to sender failed, manual refund required"
                        );
                    }
                }
                None => warn!(
                    awaiting_id = %awaiting.id,
                    wallet_id = %wallet.id,
                    amount = %available,
                    "Sender unknown, manual refund required"
                ),
            }
        }

        if let Some(ref user_id) = awaiting.user_id {
            self.notifier.enqueue(Notification::refund_issued(
                user_id,
                available,
                shortfall,
                &wallet.currency,
            ));
        }
        Ok(())
    }
}
