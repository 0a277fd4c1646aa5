//! Slot reservation: claims order capacity for an in-flight fill.
//!
//! Capacity is claimed with one compare-and-increment on the order row, so
//! concurrent reservations can never overbook an order. Every reservation is
//! backed by exactly one PENDING awaiting and is returned to the order at
//! most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::decimal;
use crate::domain::{
    Awaiting, AwaitingStatus, CurrencyCatalog, DeliveryTarget, Funding, Order, OrderType,
    RejectReason, Rejection, Transaction, TransactionKind, TransactionStatus, TransactionType,
    Wallet, expiry_key,
};
use crate::notification::{Notification, Notifier};
use crate::payments::{DepositInstructions, DepositRequest, PaymentError, PaymentGateway};
use crate::scheduler::{ScheduledAction, Scheduler};
use crate::settlement::{Result, SettlementError};
use crate::storage::{ReserveOutcome, Storage};

/// FillRequest asks to fill part of an order.
#[derive(Debug, Clone)]
pub struct FillRequest {
    pub order_id: String,
    /// Amount offered, in the filler currency.
    pub amount: Decimal,
    /// Filler, when authenticated.
    pub user_id: Option<String>,
    pub funding: Funding,
    /// Filler-currency wallet that pays: the filler's own wallet for
    /// `Wallet` funding, otherwise the intermediary wallet the payment lands in.
    pub payer_wallet_id: String,
    /// Order-currency wallet that receives the escrow draw.
    pub receiver_wallet_id: String,
    pub delivery: Option<DeliveryTarget>,
    /// Payer contact for gateway checkouts.
    pub email: Option<String>,
}

impl FillRequest {
    pub fn new(
        order_id: impl Into<String>,
        amount: Decimal,
        funding: Funding,
        payer_wallet_id: impl Into<String>,
        receiver_wallet_id: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            amount,
            user_id: None,
            funding,
            payer_wallet_id: payer_wallet_id.into(),
            receiver_wallet_id: receiver_wallet_id.into(),
            delivery: None,
            email: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryTarget) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// SlotReservation is a successful reservation.
#[derive(Debug, Clone)]
pub struct SlotReservation {
    pub awaiting: Awaiting,
    /// Checkout details for `FiatPayment` funding.
    pub instructions: Option<DepositInstructions>,
}

impl SlotReservation {
    pub fn awaiting_id(&self) -> &str {
        &self.awaiting.id
    }
}

/// Reference used for the gateway deposit backing an awaiting.
pub fn deposit_reference(awaiting_id: &str) -> String {
    format!("dep_{}", awaiting_id)
}

/// ReservationManager reserves and releases order capacity.
pub struct ReservationManager {
    storage: Arc<dyn Storage>,
    catalog: Arc<dyn CurrencyCatalog>,
    payments: Option<Arc<dyn PaymentGateway>>,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn Notifier>,
    reservation_ttl: Duration,
    init_timeout: Duration,
}

impl ReservationManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn CurrencyCatalog>,
        payments: Option<Arc<dyn PaymentGateway>>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
        reservation_ttl: Duration,
        init_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            catalog,
            payments,
            scheduler,
            notifier,
            reservation_ttl,
            init_timeout,
        }
    }

    pub fn reservation_ttl(&self) -> Duration {
        self.reservation_ttl
    }

    /// Stops the scheduled expiry of an awaiting that is being settled.
    pub fn cancel_expiry(&self, awaiting_id: &str) {
        if self.scheduler.cancel(&expiry_key(awaiting_id)) {
            debug!(awaiting_id, "Expiry cancelled");
        }
    }

    /// Reserves capacity for a fill and returns the PENDING awaiting.
    ///
    /// Every validation runs before the single conditional write. A rejection
    /// caused by capacity carries the order's current available amount.
    pub async fn reserve_slot(&self, request: &FillRequest) -> Result<SlotReservation> {
        if request.amount <= Decimal::ZERO {
            return Err(SettlementError::rejected(
                RejectReason::InvalidAmount,
                "fill amount must be positive",
            ));
        }

        let order = self
            .storage
            .get_order(&request.order_id)
            .await?
            .ok_or_else(|| {
                SettlementError::rejected(RejectReason::OrderNotFound, "order does not exist")
            })?;

        if !order.is_open() {
            return Err(Rejection::new(
                RejectReason::OrderNotOpen,
                format!("order is {}", order.status),
            )
            .with_available(Decimal::ZERO)
            .into());
        }

        let filler_profile = self.catalog.profile(order.filler_currency());
        if filler_profile.check_precision(request.amount).is_err() {
            return Err(SettlementError::rejected(
                RejectReason::PrecisionExceeded,
                format!(
                    "{} accepts at most {} decimal places",
                    order.filler_currency(),
                    filler_profile.storage_decimals
                ),
            ));
        }

        let payer = self.validate_wallets(&order, request).await?;
        let delivery = self.validate_delivery(&order, request).await?;

        let order_profile = self.catalog.profile(order.order_currency());
        let order_amount = decimal::to_order_currency(
            request.amount,
            order.price,
            order.order_type,
            &order_profile,
        )?;

        if order_amount <= Decimal::ZERO {
            return Err(SettlementError::rejected(
                RejectReason::InvalidAmount,
                "fill amount converts to nothing at the order price",
            ));
        }
        // The last slice of an order may be smaller than its minimum.
        let takes_remainder = decimal::approx_eq(order_amount, order.available());
        if !decimal::gte(order_amount, order.amount_minimum) && !takes_remainder {
            return Err(Rejection::new(
                RejectReason::BelowMinimum,
                format!(
                    "fill of {} {} is below the minimum of {} {}",
                    order_amount.normalize(),
                    order.order_currency(),
                    order.amount_minimum.normalize(),
                    order.order_currency()
                ),
            )
            .with_available(order.available())
            .into());
        }

        let awaiting = self.build_awaiting(&order, request, &payer, delivery, order_amount);

        match self
            .storage
            .reserve_capacity(&order.id, order_amount, &awaiting)
            .await?
        {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Unavailable => return Err(self.classify_unavailable(&order.id).await),
            ReserveOutcome::AddressBusy => {
                return Err(SettlementError::rejected(
                    RejectReason::AddressBusy,
                    "another payment is already expected at this deposit address",
                ));
            }
        }

        info!(
            order_id = %order.id,
            awaiting_id = %awaiting.id,
            amount = %request.amount,
            order_amount = %order_amount,
            funding = %awaiting.funding,
            "Slot reserved"
        );

        self.scheduler.schedule_once(
            &awaiting.expiry_key(),
            ScheduledAction::ExpireAwaiting(awaiting.id.clone()),
            self.reservation_ttl,
        );

        let instructions = match awaiting.funding {
            Funding::FiatPayment => Some(self.initiate_payment(&awaiting, request).await?),
            _ => None,
        };

        Ok(SlotReservation {
            awaiting,
            instructions,
        })
    }

    /// Returns a PENDING awaiting's capacity to its order. Returns false when
    /// nothing was outstanding.
    pub async fn release_reservation(&self, awaiting_id: &str) -> Result<bool> {
        let Some(awaiting) = self.storage.get_awaiting(awaiting_id).await? else {
            return Ok(false);
        };
        self.release(&awaiting, AwaitingStatus::Pending).await
    }

    /// Fails an awaiting that has not settled: releases its reservation,
    /// marks it FAILED and fails its pending transactions.
    pub async fn cancel_awaiting(&self, awaiting_id: &str, reason: &str) -> Result<bool> {
        let Some(awaiting) = self.storage.get_awaiting(awaiting_id).await? else {
            return Err(SettlementError::rejected(
                RejectReason::AwaitingNotFound,
                "awaiting does not exist",
            ));
        };
        self.retire(&awaiting, AwaitingStatus::Failed, reason).await
    }

    /// Ages out a still-PENDING awaiting. Anything else is left alone.
    pub async fn expire_awaiting(&self, awaiting_id: &str) -> Result<bool> {
        let Some(awaiting) = self.storage.get_awaiting(awaiting_id).await? else {
            return Ok(false);
        };
        if awaiting.status != AwaitingStatus::Pending {
            debug!(awaiting_id, status = %awaiting.status, "Expiry skipped, awaiting moved on");
            return Ok(false);
        }

        let expired = self
            .retire(&awaiting, AwaitingStatus::Expired, "reservation expired")
            .await?;

        if expired {
            info!(awaiting_id, order_id = %awaiting.order_id, "Awaiting expired");
            if let Some(ref user_id) = awaiting.user_id {
                self.notifier.enqueue(Notification::awaiting_expired(
                    user_id,
                    &awaiting.id,
                    self.reservation_ttl,
                ));
            }
        }
        Ok(expired)
    }

    /// Moves a non-terminal, unapplied awaiting to `to` and then releases its
    /// reservation. The status moves first so no claim can slip in between.
    pub(crate) async fn retire(
        &self,
        awaiting: &Awaiting,
        to: AwaitingStatus,
        reason: &str,
    ) -> Result<bool> {
        if awaiting.status.is_terminal() || awaiting.fill_applied {
            return Ok(false);
        }

        let moved = self
            .storage
            .transition_awaiting(&awaiting.id, awaiting.status, to, Some(reason))
            .await?;
        if !moved {
            debug!(awaiting_id = %awaiting.id, to = %to, "Awaiting changed concurrently");
            return Ok(false);
        }

        self.scheduler.cancel(&awaiting.expiry_key());
        self.release(awaiting, to).await?;

        let failed = self
            .storage
            .fail_pending_transactions(&awaiting.id)
            .await?;
        if failed > 0 {
            debug!(awaiting_id = %awaiting.id, failed, "Pending transactions failed");
        }

        info!(
            awaiting_id = %awaiting.id,
            from = %awaiting.status,
            to = %to,
            reason,
            "Awaiting retired"
        );
        Ok(true)
    }

    async fn release(&self, awaiting: &Awaiting, from: AwaitingStatus) -> Result<bool> {
        let released = self
            .storage
            .release_reservation(&awaiting.id, from, awaiting.order_amount)
            .await?;

        if released {
            debug!(
                awaiting_id = %awaiting.id,
                order_id = %awaiting.order_id,
                amount = %awaiting.order_amount,
                "Reservation released"
            );
        }
        Ok(released)
    }

    /// Checks the payer and receiver wallets and returns the payer.
    async fn validate_wallets(&self, order: &Order, request: &FillRequest) -> Result<Wallet> {
        let payer = self.wallet(&request.payer_wallet_id).await?;
        if payer.currency != order.filler_currency() {
            return Err(SettlementError::rejected(
                RejectReason::InvalidWallet,
                format!("payer wallet must hold {}", order.filler_currency()),
            ));
        }

        match request.funding {
            Funding::Wallet => {
                if request.user_id.is_none() || payer.user_id != request.user_id {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidWallet,
                        "payer wallet does not belong to the filler",
                    ));
                }
            }
            Funding::CryptoDeposit => {
                if payer.deposit_address.is_none() {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidWallet,
                        "deposit wallet has no address",
                    ));
                }
            }
            Funding::FiatPayment => {
                if self.payments.is_none() {
                    return Err(SettlementError::rejected(
                        RejectReason::PaymentInitFailed,
                        "fiat payments are not available",
                    ));
                }
            }
        }

        let receiver = self.wallet(&request.receiver_wallet_id).await?;
        if receiver.currency != order.order_currency() {
            return Err(SettlementError::rejected(
                RejectReason::InvalidWallet,
                format!("receiver wallet must hold {}", order.order_currency()),
            ));
        }

        Ok(payer)
    }

    async fn wallet(&self, wallet_id: &str) -> Result<Wallet> {
        self.storage.get_wallet(wallet_id).await?.ok_or_else(|| {
            SettlementError::rejected(
                RejectReason::InvalidWallet,
                format!("wallet {} does not exist", wallet_id),
            )
        })
    }

    /// Bank delivery pays out the fiat leg of a BUY, address delivery the
    /// crypto leg of a SELL. Bank details are verified before anything is
    /// written.
    async fn validate_delivery(
        &self,
        order: &Order,
        request: &FillRequest,
    ) -> Result<Option<DeliveryTarget>> {
        let Some(ref delivery) = request.delivery else {
            return Ok(None);
        };

        match delivery {
            DeliveryTarget::Bank {
                bank_code,
                account_number,
                ..
            } => {
                if order.order_type != OrderType::Buy {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidDelivery,
                        "bank delivery is only available for buy orders",
                    ));
                }
                let Some(ref payments) = self.payments else {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidDelivery,
                        "bank payouts are not available",
                    ));
                };

                match payments.resolve_account(bank_code, account_number).await {
                    Ok(resolved) => Ok(Some(DeliveryTarget::Bank {
                        bank_code: resolved.bank_code,
                        account_number: resolved.account_number,
                        account_name: Some(resolved.account_name),
                    })),
                    Err(PaymentError::AccountNotResolved(message)) => Err(
                        SettlementError::rejected(RejectReason::InvalidDelivery, message),
                    ),
                    Err(e) => Err(e.into()),
                }
            }
            DeliveryTarget::Address { address, .. } => {
                if order.order_type != OrderType::Sell {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidDelivery,
                        "address delivery is only available for sell orders",
                    ));
                }
                if address.trim().is_empty() {
                    return Err(SettlementError::rejected(
                        RejectReason::InvalidDelivery,
                        "delivery address is empty",
                    ));
                }
                Ok(Some(delivery.clone()))
            }
        }
    }

    fn build_awaiting(
        &self,
        order: &Order,
        request: &FillRequest,
        payer: &Wallet,
        delivery: Option<DeliveryTarget>,
        order_amount: Decimal,
    ) -> Awaiting {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let deposit_address = match request.funding {
            Funding::CryptoDeposit => payer.deposit_address.clone(),
            _ => None,
        };
        let payment_reference = match request.funding {
            Funding::FiatPayment => Some(deposit_reference(&id)),
            _ => None,
        };

        Awaiting {
            id,
            order_id: order.id.clone(),
            order_type: order.order_type,
            amount: request.amount,
            order_amount,
            currency: order.filler_currency().to_string(),
            status: AwaitingStatus::Pending,
            user_id: request.user_id.clone(),
            funding: request.funding,
            payer_wallet_id: payer.id.clone(),
            receiver_wallet_id: request.receiver_wallet_id.clone(),
            deposit_address,
            payment_reference,
            delivery,
            shortfall: None,
            failure_reason: None,
            reservation_released: false,
            fill_applied: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-reads the order to explain why the conditional update matched nothing.
    async fn classify_unavailable(&self, order_id: &str) -> SettlementError {
        let order = match self.storage.get_order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                return SettlementError::rejected(RejectReason::OrderNotFound, "order does not exist");
            }
            Err(e) => return e.into(),
        };

        if !order.is_open() {
            return Rejection::new(RejectReason::OrderNotOpen, format!("order is {}", order.status))
                .with_available(Decimal::ZERO)
                .into();
        }

        debug!(order_id, available = %order.available(), "Reservation exceeds capacity");
        let filler_profile = self.catalog.profile(order.filler_currency());
        let message = match decimal::to_filler_currency(
            order.available(),
            order.price,
            order.order_type,
            &filler_profile,
        ) {
            Ok(payable) => format!(
                "requested amount exceeds the order's remaining capacity of {} {}",
                payable.normalize(),
                order.filler_currency()
            ),
            Err(_) => "requested amount exceeds the order's remaining capacity".to_string(),
        };
        Rejection::new(RejectReason::InsufficientCapacity, message)
            .with_available(order.available())
            .into()
    }

    /// Starts the gateway checkout for a fiat-funded awaiting. A timeout or
    /// failure releases the reservation and fails the awaiting.
    async fn initiate_payment(
        &self,
        awaiting: &Awaiting,
        request: &FillRequest,
    ) -> Result<DepositInstructions> {
        let reference = deposit_reference(&awaiting.id);
        let deposit = DepositRequest {
            reference: reference.clone(),
            amount: awaiting.amount,
            currency: awaiting.currency.clone(),
            email: request.email.clone(),
        };

        let outcome = match self.payments {
            Some(ref payments) => {
                match tokio::time::timeout(self.init_timeout, payments.initiate_deposit(&deposit))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(PaymentError::Timeout(self.init_timeout)),
                }
            }
            None => Err(PaymentError::Api {
                status: 0,
                message: "payments disabled".to_string(),
            }),
        };

        let instructions = match outcome {
            Ok(instructions) => instructions,
            Err(e) => {
                warn!(awaiting_id = %awaiting.id, error = %e, "Payment initialization failed");
                let reason = format!("payment initialization failed: {}", e);
                if let Err(cleanup) = self.retire(awaiting, AwaitingStatus::Failed, &reason).await {
                    warn!(awaiting_id = %awaiting.id, error = %cleanup, "Failed to release reservation");
                }
                return Err(SettlementError::rejected(
                    RejectReason::PaymentInitFailed,
                    e.to_string(),
                ));
            }
        };

        let tx = Transaction::new(
            &reference,
            &awaiting.payer_wallet_id,
            awaiting.amount,
            &awaiting.currency,
            TransactionType::Credit,
            TransactionKind::Deposit,
        )
        .with_status(TransactionStatus::Pending)
        .with_user(awaiting.user_id.clone())
        .with_awaiting(&awaiting.id)
        .with_external_id(instructions.external_id.clone());
        self.storage.insert_transaction(&tx).await?;

        info!(awaiting_id = %awaiting.id, reference = %reference, "Payment initiated");
        Ok(instructions)
    }
}
