//! Event settlement pipeline: custody deposit pushes, payment gateway
//! callbacks and reservation expiry.
//!
//! Every inbound event is keyed by its external reference; a Transaction
//! already recorded under that reference and wallet makes the event a no-op.
//! Once a payload is authenticated and well formed the handlers always
//! acknowledge it, deferring failed processing to the retry paths instead of
//! asking the provider to redeliver.

mod deposit;
mod expiry;
mod payload;
mod payment;

pub use payload::{DepositEvent, PaymentCallback, PaymentEventKind};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::domain::CurrencyCatalog;
use crate::ledger::LedgerGateway;
use crate::notification::Notifier;
use crate::reservation::ReservationManager;
use crate::service::{Counter, Counters};
use crate::settlement::SettlementEngine;
use crate::signature;
use crate::storage::Storage;

/// How an authenticated webhook was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Processed,
    /// Already seen; nothing changed.
    Duplicate,
    /// Nothing to do for this payload.
    Ignored,
    /// Accepted; settlement continues in the background.
    Deferred,
}

/// Reasons a webhook is refused before any processing.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook signature")]
    Unauthorized,
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
}

/// EventPipeline turns external money movements into settlements.
pub struct EventPipeline {
    storage: Arc<dyn Storage>,
    ledger: Arc<LedgerGateway>,
    catalog: Arc<dyn CurrencyCatalog>,
    reservations: Arc<ReservationManager>,
    engine: Arc<SettlementEngine>,
    notifier: Arc<dyn Notifier>,
    counters: Arc<Counters>,
    webhooks: WebhookConfig,
    /// Platform wallet whose outgoing movements are not notified.
    operational_wallet_id: Option<String>,
}

impl EventPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        ledger: Arc<LedgerGateway>,
        catalog: Arc<dyn CurrencyCatalog>,
        reservations: Arc<ReservationManager>,
        engine: Arc<SettlementEngine>,
        notifier: Arc<dyn Notifier>,
        counters: Arc<Counters>,
        webhooks: WebhookConfig,
        operational_wallet_id: Option<String>,
    ) -> Self {
        Self {
            storage,
            ledger,
            catalog,
            reservations,
            engine,
            notifier,
            counters,
            webhooks,
            operational_wallet_id,
        }
    }

    /// Authenticates and handles a raw custody deposit push.
    pub async fn handle_deposit_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookAck, WebhookError> {
        authenticate(
            &self.webhooks.deposit_secret,
            self.webhooks.allow_unsigned,
            body,
            signature,
        )?;
        let event: DepositEvent =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        event.validate().map_err(WebhookError::Malformed)?;

        Ok(self.handle_deposit_event(&event).await)
    }

    /// Authenticates and handles a raw payment gateway callback.
    pub async fn handle_payment_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookAck, WebhookError> {
        authenticate(
            &self.webhooks.payment_secret,
            self.webhooks.allow_unsigned,
            body,
            signature,
        )?;
        let callback: PaymentCallback =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        callback.validate().map_err(WebhookError::Malformed)?;

        Ok(self.handle_payment_callback(&callback).await)
    }

    fn count(&self, ack: WebhookAck) {
        match ack {
            WebhookAck::Duplicate => self.counters.incr(Counter::DuplicateEvent),
            WebhookAck::Processed | WebhookAck::Deferred => {
                self.counters.incr(Counter::EventProcessed)
            }
            WebhookAck::Ignored => {}
        }
    }
}

fn authenticate(
    secret: &str,
    allow_unsigned: bool,
    body: &[u8],
    signature: &str,
) -> Result<(), WebhookError> {
    if secret.is_empty() {
        if allow_unsigned {
            debug!("Webhook secret not configured, skipping signature check");
            return Ok(());
        }
        warn!("Webhook secret not configured and unsigned webhooks are not allowed");
        return Err(WebhookError::Unauthorized);
    }
    if !signature::verify(secret, body, signature) {
        warn!("Webhook signature rejected");
        return Err(WebhookError::Unauthorized);
    }
    Ok(())
}
