//! Order placement and cancellation.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::{Result, SettlementEngine, SettlementError};
use crate::decimal;
use crate::domain::{
    Order, OrderStatus, OrderType, RejectReason, Rejection, TransactionKind, Wallet,
    filler_currency, order_currency,
};
use crate::ledger::Posting;

/// OrderRequest asks to place a standing order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub user_id: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub order_type: OrderType,
    /// Gross amount in the order currency, before the placement fee.
    pub amount: Decimal,
    /// Quote per base.
    pub price: Decimal,
    /// Smallest fill the owner accepts, in the order currency.
    pub minimum: Option<Decimal>,
    /// Owner wallet in the order currency; funds the escrow.
    pub wallet_id: String,
    /// Owner wallet in the filler currency; receives fill payments.
    pub proceeds_wallet_id: String,
}

impl SettlementEngine {
    /// Places an order: charges the fee, escrows the tradable amount and
    /// inserts the order OPEN at version 0.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        if request.amount <= Decimal::ZERO || request.price <= Decimal::ZERO {
            return Err(SettlementError::rejected(
                RejectReason::InvalidAmount,
                "amount and price must be positive",
            ));
        }
        if request.minimum.is_some_and(|m| m < Decimal::ZERO) {
            return Err(SettlementError::rejected(
                RejectReason::InvalidAmount,
                "minimum must not be negative",
            ));
        }

        let base = request.base_currency.to_uppercase();
        let quote = request.quote_currency.to_uppercase();
        for code in [&base, &quote] {
            if self.catalog.get(code).is_none() {
                return Err(SettlementError::rejected(
                    RejectReason::UnknownCurrency,
                    format!("currency {} is not supported", code),
                ));
            }
        }

        let currency = order_currency(request.order_type, &base, &quote).to_string();
        let proceeds_currency = filler_currency(request.order_type, &base, &quote).to_string();
        let profile = self.catalog.profile(&currency);
        if profile.check_precision(request.amount).is_err() {
            return Err(SettlementError::rejected(
                RejectReason::PrecisionExceeded,
                format!(
                    "{} accepts at most {} decimal places",
                    currency, profile.storage_decimals
                ),
            ));
        }

        let wallet = self
            .owned_wallet(&request.wallet_id, &request.user_id, &currency)
            .await?;
        let proceeds = self
            .owned_wallet(&request.proceeds_wallet_id, &request.user_id, &proceeds_currency)
            .await?;

        let fee_wallet = self.fee_wallet(&currency).await?;
        let fee = match fee_wallet {
            Some(_) => profile.to_storage(request.amount * self.config.fee_rate()),
            None => Decimal::ZERO,
        };
        let tradable = request.amount - fee;

        let catalog_minimum = self
            .catalog
            .get(&currency)
            .map(|c| c.minimum_amount)
            .unwrap_or(Decimal::ZERO);
        let floor = request.minimum.unwrap_or(Decimal::ZERO).max(catalog_minimum);

        // The fee can push the tradable remainder below the economic floor.
        if tradable <= Decimal::ZERO || !decimal::gte(tradable, floor) {
            return Err(SettlementError::rejected(
                RejectReason::BelowMinimum,
                format!(
                    "tradable amount {} {} after fee {} is below the minimum of {}",
                    tradable.normalize(),
                    currency,
                    fee.normalize(),
                    floor.normalize()
                ),
            ));
        }

        let available = self.ledger.available(&wallet.id).await?;
        if available < request.amount {
            return Err(Rejection::new(
                RejectReason::InsufficientBalance,
                format!(
                    "wallet {} holds {} {}, order needs {}",
                    wallet.id,
                    available.normalize(),
                    currency,
                    request.amount.normalize()
                ),
            )
            .with_available(available)
            .into());
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        let escrow_reference = format!("escrow_{}", order_id);
        let hold_id = self
            .ledger
            .escrow(&wallet.id, tradable, &escrow_reference)
            .await?;

        let mut fee_charged = None;
        if let Some(fee_wallet) = fee_wallet {
            if fee > Decimal::ZERO {
                let reference = format!("fee_{}", order_id);
                let posting = Posting::new(&reference, TransactionKind::Fee);
                if let Err(e) = self.ledger.transfer(&wallet, &fee_wallet, fee, posting).await {
                    warn!(order_id = %order_id, error = %e, "Fee transfer failed, releasing escrow");
                    self.unwind_placement(&order_id, &hold_id, &wallet, tradable, None)
                        .await;
                    return Err(e.into());
                }
                fee_charged = Some(fee_wallet);
            }
        }

        let now = Utc::now();
        let order = Order {
            id: order_id,
            user_id: request.user_id.clone(),
            base_currency: base,
            quote_currency: quote,
            order_type: request.order_type,
            amount: tradable,
            amount_processed: Decimal::ZERO,
            amount_reserved: Decimal::ZERO,
            amount_minimum: floor,
            price: request.price,
            fee,
            percentage_processed: Decimal::ZERO,
            status: OrderStatus::Open,
            version: 0,
            escrow_hold_id: hold_id,
            wallet_id: wallet.id.clone(),
            proceeds_wallet_id: proceeds.id.clone(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.storage.insert_order(&order).await {
            warn!(order_id = %order.id, error = %e, "Order insert failed, releasing escrow");
            let fee_charged = fee_charged.as_ref().map(|w| (w, fee));
            self.unwind_placement(&order.id, &order.escrow_hold_id, &wallet, tradable, fee_charged)
                .await;
            return Err(e.into());
        }

        info!(
            order_id = %order.id,
            user_id = %order.user_id,
            order_type = %order.order_type,
            amount = %order.amount,
            fee = %order.fee,
            price = %order.price,
            minimum = %order.amount_minimum,
            "Order placed"
        );
        Ok(order)
    }

    /// Cancels an order with no in-flight fills and releases what is left of
    /// its escrow.
    pub async fn cancel_order(&self, order_id: &str, owner_id: &str) -> Result<Order> {
        let order = self.storage.get_order(order_id).await?.ok_or_else(|| {
            SettlementError::rejected(RejectReason::OrderNotFound, "order does not exist")
        })?;

        if order.user_id != owner_id {
            return Err(SettlementError::rejected(
                RejectReason::NotOwner,
                "only the owner can cancel an order",
            ));
        }
        if !order.is_open() {
            return Err(SettlementError::rejected(
                RejectReason::OrderNotOpen,
                format!("order is {}", order.status),
            ));
        }

        let active = self.storage.count_active_awaitings(order_id).await?;
        if active > 0 {
            return Err(SettlementError::rejected(
                RejectReason::ActiveFills,
                format!("{} fills are still in flight", active),
            ));
        }

        if !self.storage.cancel_order(order_id, order.version).await? {
            let active = self.storage.count_active_awaitings(order_id).await?;
            if active > 0 {
                return Err(SettlementError::rejected(
                    RejectReason::ActiveFills,
                    format!("{} fills are still in flight", active),
                ));
            }
            return Err(SettlementError::rejected(
                RejectReason::InvalidState,
                "order changed while cancelling, retry",
            ));
        }

        let reference = format!("cancel_{}", order_id);
        match self
            .ledger
            .release_escrow(&order.escrow_hold_id, &order.wallet_id, &reference)
            .await
        {
            Ok(released) => {
                info!(order_id, released = %released, "Order canceled");
            }
            Err(e) => {
                self.record_gap(
                    order_id,
                    None,
                    "escrow_release",
                    order.remaining(),
                    order.order_currency(),
                    &e.to_string(),
                )
                .await;
            }
        }

        self.storage
            .get_order(order_id)
            .await?
            .ok_or_else(|| SettlementError::rejected(RejectReason::OrderNotFound, "order vanished"))
    }

    /// Returns a placement's funds to the owner after a later step failed:
    /// releases the escrow hold and refunds a charged fee. A leg that cannot
    /// be undone is recorded as a reconciliation gap.
    async fn unwind_placement(
        &self,
        order_id: &str,
        hold_id: &str,
        wallet: &Wallet,
        escrowed: Decimal,
        fee_charged: Option<(&Wallet, Decimal)>,
    ) {
        let release_reference = format!("escrow_{}_release", order_id);
        if let Err(e) = self
            .ledger
            .release_escrow(hold_id, &wallet.id, &release_reference)
            .await
        {
            self.record_gap(
                order_id,
                None,
                "escrow_release",
                escrowed,
                &wallet.currency,
                &e.to_string(),
            )
            .await;
        }

        if let Some((fee_wallet, fee)) = fee_charged {
            let reference = format!("fee_{}_refund", order_id);
            let posting = Posting::new(&reference, TransactionKind::Refund);
            if let Err(e) = self.ledger.transfer(fee_wallet, wallet, fee, posting).await {
                self.record_gap(order_id, None, "fee_refund", fee, &wallet.currency, &e.to_string())
                    .await;
            }
        }
    }

    async fn owned_wallet(&self, wallet_id: &str, user_id: &str, currency: &str) -> Result<Wallet> {
        let wallet = self.storage.get_wallet(wallet_id).await?.ok_or_else(|| {
            SettlementError::rejected(
                RejectReason::InvalidWallet,
                format!("wallet {} does not exist", wallet_id),
            )
        })?;

        if wallet.user_id.as_deref() != Some(user_id) || wallet.currency != currency {
            return Err(SettlementError::rejected(
                RejectReason::InvalidWallet,
                format!("wallet {} is not the owner's {} wallet", wallet_id, currency),
            ));
        }
        Ok(wallet)
    }

    /// Fee wallet for a currency, created in the cache on first use. None
    /// when fees are off or no wallet is configured for the currency.
    async fn fee_wallet(&self, currency: &str) -> Result<Option<Wallet>> {
        if self.config.fee_rate() <= Decimal::ZERO {
            return Ok(None);
        }
        let Some(wallet_id) = self.config.fee_wallet(currency) else {
            warn!(currency, "No fee wallet configured, placing order without fee");
            return Ok(None);
        };

        if let Some(wallet) = self.storage.get_wallet(wallet_id).await? {
            return Ok(Some(wallet));
        }
        let wallet = Wallet::new(wallet_id, None, currency);
        self.storage.upsert_wallet(&wallet).await?;
        Ok(Some(wallet))
    }
}
