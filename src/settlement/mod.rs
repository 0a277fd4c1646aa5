//! Order settlement: placement, fill application, fund movement and
//! cancellation.
//!
//! The order row is the only serialization point. Fills are applied with a
//! version-guarded conditional update; a conflicting fill is retried a few
//! times in-process and then handed to a durable retry queue. Funds move
//! only after the bookkeeping has committed, and a fund leg that fails
//! afterwards is recorded as a reconciliation gap instead of being
//! compensated.

mod error;
mod fill;
mod payout;
mod placement;
mod queue;

pub use error::{Result, SettlementError};
pub use payout::payout_reference;
pub use placement::OrderRequest;
pub use queue::DrainReport;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::error;

use crate::config::SettlementConfig;
use crate::domain::{CurrencyCatalog, OrderStatus, ReconciliationGap};
use crate::ledger::LedgerGateway;
use crate::notification::Notifier;
use crate::payments::PaymentGateway;
use crate::reservation::ReservationManager;
use crate::service::{Counter, Counters};
use crate::storage::Storage;

/// FillSummary describes an applied fill.
#[derive(Debug, Clone, Serialize)]
pub struct FillSummary {
    pub order_id: String,
    pub awaiting_id: String,
    /// Amount the filler paid, in the filler currency.
    pub fill_amount: Decimal,
    pub fill_currency: String,
    /// Amount drawn from the order, in the order currency.
    pub order_amount: Decimal,
    pub order_currency: String,
    pub amount_processed: Decimal,
    pub percentage_processed: Decimal,
    pub status: OrderStatus,
    pub version: i64,
    /// Version conflicts absorbed before the fill applied.
    pub conflicts: u32,
    /// False when a fund leg failed after the bookkeeping committed.
    pub funds_moved: bool,
}

/// Outcome of a settlement request.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    Settled(FillSummary),
    /// Contention persisted; the fill will be retried from the queue.
    Queued,
}

/// SettlementEngine owns the order lifecycle.
pub struct SettlementEngine {
    storage: Arc<dyn Storage>,
    ledger: Arc<LedgerGateway>,
    catalog: Arc<dyn CurrencyCatalog>,
    reservations: Arc<ReservationManager>,
    payments: Option<Arc<dyn PaymentGateway>>,
    notifier: Arc<dyn Notifier>,
    counters: Arc<Counters>,
    config: SettlementConfig,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        ledger: Arc<LedgerGateway>,
        catalog: Arc<dyn CurrencyCatalog>,
        reservations: Arc<ReservationManager>,
        payments: Option<Arc<dyn PaymentGateway>>,
        notifier: Arc<dyn Notifier>,
        counters: Arc<Counters>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            storage,
            ledger,
            catalog,
            reservations,
            payments,
            notifier,
            counters,
            config,
        }
    }

    /// Persists a reconciliation gap. The gap is logged even when it cannot
    /// be stored.
    async fn record_gap(
        &self,
        order_id: &str,
        awaiting_id: Option<&str>,
        leg: &str,
        amount: Decimal,
        currency: &str,
        cause: &str,
    ) {
        error!(
            order_id,
            awaiting_id = awaiting_id.unwrap_or("-"),
            leg,
            amount = %amount,
            currency,
            error = cause,
            "Reconciliation gap: bookkeeping committed but fund leg failed"
        );
        self.counters.incr(Counter::ReconciliationGap);

        let gap = ReconciliationGap {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            awaiting_id: awaiting_id.map(str::to_string),
            leg: leg.to_string(),
            amount,
            currency: currency.to_string(),
            error: cause.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.record_gap(&gap).await {
            error!(order_id, leg, error = %e, "Failed to persist reconciliation gap");
        }
    }
}

#[cfg(test)]
mod tests;
