//! Post-settlement payout of the order-currency leg.
//!
//! Runs after both fund legs succeeded. The fill itself is never rolled back
//! from here: a failed payout leaves the funds in the receiver wallet and
//! marks the awaiting FAILED with diagnostics.

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::SettlementEngine;
use crate::domain::{Awaiting, AwaitingStatus, DeliveryTarget, Order, TransactionKind};
use crate::ledger::Posting;
use crate::notification::{Notification, format_amount};
use crate::payments::PayoutRequest;

/// Reference of the payout that delivers an awaiting's proceeds.
pub fn payout_reference(awaiting_id: &str) -> String {
    format!("pay_{}", awaiting_id)
}

impl SettlementEngine {
    /// Delivers the proceeds of a settled fill and moves the awaiting to its
    /// terminal state.
    pub(super) async fn finish(&self, order: &Order, awaiting: &Awaiting, order_amount: Decimal) {
        let outcome = match awaiting.delivery {
            None => Ok(()),
            Some(DeliveryTarget::Bank {
                ref bank_code,
                ref account_number,
                ref account_name,
            }) => {
                self.pay_to_bank(
                    order,
                    awaiting,
                    order_amount,
                    bank_code,
                    account_number,
                    account_name.as_deref(),
                )
                .await
            }
            Some(DeliveryTarget::Address {
                ref address,
                ref network,
            }) => {
                self.pay_to_address(awaiting, order_amount, address, network.as_deref())
                    .await
            }
        };

        let (to, reason) = match outcome {
            Ok(()) => (AwaitingStatus::Success, None),
            Err(cause) => {
                warn!(
                    awaiting_id = %awaiting.id,
                    order_id = %order.id,
                    error = %cause,
                    "Payout failed, fill stands"
                );
                if let Some(ref user_id) = awaiting.user_id {
                    self.notifier.enqueue(Notification::payout_failed(
                        user_id,
                        order_amount,
                        order.order_currency(),
                    ));
                }
                (AwaitingStatus::Failed, Some(format!("payout failed: {}", cause)))
            }
        };

        match self
            .storage
            .transition_awaiting(&awaiting.id, AwaitingStatus::Processing, to, reason.as_deref())
            .await
        {
            Ok(true) => info!(awaiting_id = %awaiting.id, status = %to, "Awaiting finished"),
            Ok(false) => warn!(awaiting_id = %awaiting.id, "Awaiting left PROCESSING concurrently"),
            Err(e) => warn!(awaiting_id = %awaiting.id, error = %e, "Failed to finish awaiting"),
        }
    }

    /// Sends fiat to a bank account and burns it from the receiver wallet.
    /// The burn stays PENDING until the payout callback confirms it.
    async fn pay_to_bank(
        &self,
        order: &Order,
        awaiting: &Awaiting,
        amount: Decimal,
        bank_code: &str,
        account_number: &str,
        account_name: Option<&str>,
    ) -> Result<(), String> {
        let Some(ref payments) = self.payments else {
            return Err("bank payouts are not available".to_string());
        };

        let reference = payout_reference(&awaiting.id);
        let request = PayoutRequest {
            reference: reference.clone(),
            amount,
            currency: order.order_currency().to_string(),
            bank_code: bank_code.to_string(),
            account_number: account_number.to_string(),
            account_name: account_name.map(str::to_string),
            narration: format!(
                "Order {} fill of {} {}",
                order.id.get(..8).unwrap_or(&order.id),
                format_amount(amount),
                order.order_currency()
            ),
        };
        let receipt = payments
            .initiate_payout(&request)
            .await
            .map_err(|e| e.to_string())?;

        let wallet = self
            .load_wallet(&awaiting.receiver_wallet_id)
            .await
            .map_err(|e| e.to_string())?;
        let posting = Posting::new(&reference, TransactionKind::Payout)
            .for_awaiting(&awaiting.id)
            .pending();
        if let Err(e) = self.ledger.debit(&wallet, amount, posting).await {
            // The bank transfer is already on its way.
            self.record_gap(
                &order.id,
                Some(&awaiting.id),
                "payout_debit",
                amount,
                order.order_currency(),
                &e.to_string(),
            )
            .await;
        }

        info!(
            awaiting_id = %awaiting.id,
            reference = %reference,
            external_id = receipt.external_id.as_deref().unwrap_or("-"),
            amount = %amount,
            "Bank payout initiated"
        );
        Ok(())
    }

    /// Withdraws crypto to the filler's address.
    async fn pay_to_address(
        &self,
        awaiting: &Awaiting,
        amount: Decimal,
        address: &str,
        network: Option<&str>,
    ) -> Result<(), String> {
        let wallet = self
            .load_wallet(&awaiting.receiver_wallet_id)
            .await
            .map_err(|e| e.to_string())?;
        let amount = self.catalog.profile(&wallet.currency).to_blockchain(amount);

        let reference = payout_reference(&awaiting.id);
        let posting =
            Posting::new(&reference, TransactionKind::Withdrawal).for_awaiting(&awaiting.id);
        let hash = self
            .ledger
            .withdraw(&wallet, amount, address, network, posting)
            .await
            .map_err(|e| e.to_string())?;

        info!(
            awaiting_id = %awaiting.id,
            address,
            amount = %amount,
            tx_hash = hash.as_deref().unwrap_or("-"),
            "Crypto payout sent"
        );
        if let Some(ref user_id) = awaiting.user_id {
            self.notifier.enqueue(Notification::withdrawal_completed(
                user_id,
                amount,
                &wallet.currency,
            ));
        }
        Ok(())
    }
}
