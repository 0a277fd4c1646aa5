//! Payment gateway callbacks: fiat deposits and bank payouts.

use tracing::{debug, error, info, warn};

use super::{EventPipeline, PaymentCallback, PaymentEventKind, WebhookAck};
use crate::domain::{Transaction, TransactionKind, TransactionStatus};
use crate::ledger::Posting;
use crate::notification::Notification;
use crate::settlement::Result;

impl EventPipeline {
    /// Handles an authenticated gateway callback. Processing errors are
    /// logged and acknowledged as deferred.
    pub async fn handle_payment_callback(&self, callback: &PaymentCallback) -> WebhookAck {
        let outcome = match callback.event {
            PaymentEventKind::PaymentSucceeded => self.payment_succeeded(callback).await,
            PaymentEventKind::PaymentFailed => self.payment_failed(callback).await,
            PaymentEventKind::PayoutSucceeded => self.payout_succeeded(callback).await,
            PaymentEventKind::PayoutFailed => self.payout_failed(callback).await,
        };

        let ack = match outcome {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    event = %callback.event,
                    reference = %callback.reference,
                    error = %e,
                    "Payment callback processing failed"
                );
                WebhookAck::Deferred
            }
        };
        self.count(ack);
        ack
    }

    /// Finds the transaction of the given kind recorded under a reference.
    async fn tracked(&self, reference: &str, kind: TransactionKind) -> Result<Option<Transaction>> {
        let found = self
            .storage
            .find_transactions_by_reference(reference)
            .await?
            .into_iter()
            .find(|tx| tx.kind == kind);
        if found.is_none() {
            warn!(reference, kind = %kind, "Callback for an untracked reference");
        }
        Ok(found)
    }

    /// Credits the payer wallet, then settles the awaiting the payment was
    /// collected for.
    async fn payment_succeeded(&self, callback: &PaymentCallback) -> Result<WebhookAck> {
        let Some(tx) = self.tracked(&callback.reference, TransactionKind::Deposit).await? else {
            return Ok(WebhookAck::Ignored);
        };
        if tx.status == TransactionStatus::Success {
            return Ok(WebhookAck::Duplicate);
        }
        let Some(wallet) = self.storage.get_wallet(&tx.wallet_id).await? else {
            warn!(reference = %tx.reference, wallet_id = %tx.wallet_id, "Deposit wallet missing");
            return Ok(WebhookAck::Ignored);
        };

        let profile = self.catalog.profile(&wallet.currency);
        let amount = callback
            .amount
            .map(|a| profile.to_storage(a))
            .unwrap_or(tx.amount);
        if amount != tx.amount {
            warn!(
                reference = %tx.reference,
                expected = %tx.amount,
                received = %amount,
                "Payment amount differs from the request"
            );
        }

        // The ledger credit is idempotent per reference, so a concurrent
        // duplicate can only lose the status transition below.
        self.ledger
            .credit(&wallet, amount, Posting::new(&tx.reference, TransactionKind::Deposit))
            .await?;
        if !self
            .storage
            .transition_transaction(&tx.reference, &wallet.id, tx.status, TransactionStatus::Success)
            .await?
        {
            return Ok(WebhookAck::Duplicate);
        }
        info!(reference = %tx.reference, wallet_id = %wallet.id, amount = %amount, "Payment credited");

        let awaiting = self
            .storage
            .find_pending_by_payment_reference(&tx.reference)
            .await?;
        let Some(mut awaiting) = awaiting else {
            if tx.status == TransactionStatus::Failed {
                warn!(reference = %tx.reference, "Late payment credited, its awaiting is gone");
            }
            if let Some(user_id) = tx.user_id.as_ref().or(wallet.user_id.as_ref()) {
                self.notifier.enqueue(Notification::deposit_received(
                    user_id,
                    amount,
                    &wallet.currency,
                ));
            }
            return Ok(WebhookAck::Processed);
        };

        if awaiting.user_id.is_none() {
            if let Some(ref user_id) = callback.user_id {
                if self.storage.assign_awaiting_user(&awaiting.id, user_id).await? {
                    awaiting.user_id = Some(user_id.clone());
                }
            }
        }

        let available = self.ledger.available(&wallet.id).await?;
        self.route_to_awaiting(&awaiting, &wallet, available, None)
            .await
    }

    /// Marks the collection failed and gives the reservation back.
    async fn payment_failed(&self, callback: &PaymentCallback) -> Result<WebhookAck> {
        let Some(tx) = self.tracked(&callback.reference, TransactionKind::Deposit).await? else {
            return Ok(WebhookAck::Ignored);
        };
        match tx.status {
            TransactionStatus::Failed => return Ok(WebhookAck::Duplicate),
            TransactionStatus::Success => {
                warn!(reference = %tx.reference, "Failure reported for a credited payment");
                return Ok(WebhookAck::Ignored);
            }
            TransactionStatus::Pending => {}
        }

        if !self
            .storage
            .transition_transaction(
                &tx.reference,
                &tx.wallet_id,
                TransactionStatus::Pending,
                TransactionStatus::Failed,
            )
            .await?
        {
            return Ok(WebhookAck::Duplicate);
        }

        let reason = callback.reason.as_deref().unwrap_or("payment failed");
        info!(reference = %tx.reference, reason, "Payment failed");

        if let Some(awaiting) = self
            .storage
            .find_pending_by_payment_reference(&tx.reference)
            .await?
        {
            let cause = format!("payment failed: {}", reason);
            if self.reservations.cancel_awaiting(&awaiting.id, &cause).await? {
                if let Some(ref user_id) = awaiting.user_id {
                    self.notifier.enqueue(Notification::fill_failed(
                        user_id,
                        &awaiting.id,
                        &cause,
                    ));
                }
            }
        }
        Ok(WebhookAck::Processed)
    }

    /// Finalizes a bank payout debit.
    async fn payout_succeeded(&self, callback: &PaymentCallback) -> Result<WebhookAck> {
        let Some(tx) = self.tracked(&callback.reference, TransactionKind::Payout).await? else {
            return Ok(WebhookAck::Ignored);
        };
        match tx.status {
            TransactionStatus::Success => return Ok(WebhookAck::Duplicate),
            TransactionStatus::Failed => {
                warn!(reference = %tx.reference, "Success reported for a reversed payout");
                return Ok(WebhookAck::Ignored);
            }
            TransactionStatus::Pending => {}
        }

        if !self
            .storage
            .transition_transaction(
                &tx.reference,
                &tx.wallet_id,
                TransactionStatus::Pending,
                TransactionStatus::Success,
            )
            .await?
        {
            return Ok(WebhookAck::Duplicate);
        }
        info!(reference = %tx.reference, amount = %tx.amount, "Payout confirmed");

        // Fill payouts were already announced with the fill.
        if tx.awaiting_id.is_none() {
            if let Some(ref user_id) = tx.user_id {
                self.notifier.enqueue(Notification::withdrawal_completed(
                    user_id,
                    tx.amount,
                    &tx.currency,
                ));
            }
        }
        Ok(WebhookAck::Processed)
    }

    /// Returns the burned funds to the wallet before marking the payout
    /// failed.
    async fn payout_failed(&self, callback: &PaymentCallback) -> Result<WebhookAck> {
        let Some(tx) = self.tracked(&callback.reference, TransactionKind::Payout).await? else {
            return Ok(WebhookAck::Ignored);
        };
        match tx.status {
            TransactionStatus::Failed => return Ok(WebhookAck::Duplicate),
            TransactionStatus::Success => {
                warn!(reference = %tx.reference, "Failure reported for a confirmed payout");
                return Ok(WebhookAck::Ignored);
            }
            TransactionStatus::Pending => {}
        }
        let Some(wallet) = self.storage.get_wallet(&tx.wallet_id).await? else {
            warn!(reference = %tx.reference, wallet_id = %tx.wallet_id, "Payout wallet missing");
            return Ok(WebhookAck::Ignored);
        };

        let reversal = reversal_reference(&tx.reference);
        let mut posting = Posting::new(&reversal, TransactionKind::Refund);
        if let Some(ref awaiting_id) = tx.awaiting_id {
            posting = posting.for_awaiting(awaiting_id);
        }
        self.ledger.credit(&wallet, tx.amount, posting).await?;

        if !self
            .storage
            .transition_transaction(
                &tx.reference,
                &tx.wallet_id,
                TransactionStatus::Pending,
                TransactionStatus::Failed,
            )
            .await?
        {
            debug!(reference = %tx.reference, "Payout already reversed");
            return Ok(WebhookAck::Duplicate);
        }
        warn!(
            reference = %tx.reference,
            wallet_id = %wallet.id,
            amount = %tx.amount,
            reason = callback.reason.as_deref().unwrap_or("-"),
            "Payout failed, funds returned to wallet"
        );

        if let Some(user_id) = tx.user_id.as_ref().or(wallet.user_id.as_ref()) {
            self.notifier.enqueue(Notification::payout_failed(
                user_id,
                tx.amount,
                &tx.currency,
            ));
        }
        Ok(WebhookAck::Processed)
    }
}

fn reversal_reference(reference: &str) -> String {
    format!("{}_reversal", reference)
}

