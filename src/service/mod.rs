//! Fill service: wires every component together and runs the background
//! loop.
//!
//! The loop delivers fired expiries, drains the settlement retry queue,
//! sweeps stale reservations and logs runtime statistics until stopped.

mod error;
mod stats;

pub use error::ServiceError;
pub use stats::{Counter, Counters, Stats};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{Config, LedgerProvider};
use crate::domain::{CurrencyCatalog, Order};
use crate::events::{EventPipeline, WebhookAck, WebhookError};
use crate::ledger::{CustodyLedger, HttpCustodyLedger, InMemoryLedger, LedgerGateway};
use crate::notification::{DispatchNotifier, DispatchSettings, NoopNotifier, Notifier};
use crate::payments::{HttpPaymentGateway, PaymentGateway};
use crate::reservation::{FillRequest, ReservationManager, SlotReservation};
use crate::scheduler::{ScheduledAction, TokioScheduler};
use crate::settlement::{self, OrderRequest, SettleOutcome, SettlementEngine};
use crate::storage::{SqliteStorage, SqliteStorageConfig, Storage};

const SCHEDULER_QUEUE_SIZE: usize = 1024;

/// FillService is the entry point for reservations, settlement and
/// inbound events.
pub struct FillService {
    cfg: Config,
    storage: Arc<SqliteStorage>,
    reservations: Arc<ReservationManager>,
    engine: Arc<SettlementEngine>,
    pipeline: Arc<EventPipeline>,
    notifier: Arc<dyn Notifier>,
    counters: Arc<Counters>,

    // Runtime state
    actions: Mutex<Option<mpsc::Receiver<ScheduledAction>>>,
    started_at: Mutex<Option<Instant>>,
    running: Mutex<bool>,
    shutdown: Notify,
}

impl FillService {
    /// Builds every component from configuration. Must be called inside a
    /// tokio runtime.
    pub async fn new(cfg: Config) -> Result<Self, ServiceError> {
        let storage = Arc::new(SqliteStorage::new(SqliteStorageConfig::from(&cfg.storage)).await?);
        let dyn_storage: Arc<dyn Storage> = storage.clone();

        let custody: Arc<dyn CustodyLedger> = match cfg.ledger.provider {
            LedgerProvider::Http => Arc::new(HttpCustodyLedger::from_config(&cfg.ledger)?),
            LedgerProvider::Memory => {
                warn!("Using the in-memory ledger, balances are not persisted");
                Arc::new(InMemoryLedger::new())
            }
        };
        let ledger = Arc::new(LedgerGateway::new(
            custody,
            dyn_storage.clone(),
            cfg.ledger.retry.clone(),
        ));

        let catalog: Arc<dyn CurrencyCatalog> = Arc::new(cfg.catalog());

        let payments: Option<Arc<dyn PaymentGateway>> = match cfg.payments {
            Some(ref payments) if payments.enabled => {
                Some(Arc::new(HttpPaymentGateway::from_config(payments)?))
            }
            _ => None,
        };
        let init_timeout = cfg
            .payments
            .as_ref()
            .map(|p| p.init_timeout())
            .unwrap_or(Duration::from_secs(20));

        let notifier = Self::build_notifier(&cfg);
        let counters = Arc::new(Counters::new());

        let (scheduler, actions) = TokioScheduler::new(SCHEDULER_QUEUE_SIZE);

        let reservations = Arc::new(ReservationManager::new(
            dyn_storage.clone(),
            catalog.clone(),
            payments.clone(),
            Arc::new(scheduler),
            notifier.clone(),
            cfg.settlement.reservation_ttl(),
            init_timeout,
        ));

        let engine = Arc::new(SettlementEngine::new(
            dyn_storage.clone(),
            ledger.clone(),
            catalog.clone(),
            reservations.clone(),
            payments,
            notifier.clone(),
            counters.clone(),
            cfg.settlement.clone(),
        ));

        let pipeline = Arc::new(EventPipeline::new(
            dyn_storage,
            ledger,
            catalog,
            reservations.clone(),
            engine.clone(),
            notifier.clone(),
            counters.clone(),
            cfg.webhooks.clone(),
            cfg.settlement.operational_wallet_id.clone(),
        ));

        Ok(Self {
            cfg,
            storage,
            reservations,
            engine,
            pipeline,
            notifier,
            counters,
            actions: Mutex::new(Some(actions)),
            started_at: Mutex::new(None),
            running: Mutex::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Creates the dispatcher notifier if configured, otherwise a no-op one.
    fn build_notifier(cfg: &Config) -> Arc<dyn Notifier> {
        let dispatcher = cfg
            .notification
            .as_ref()
            .and_then(|n| n.dispatcher.as_ref())
            .filter(|d| d.enabled);

        if let Some(dispatcher) = dispatcher {
            match DispatchNotifier::new(DispatchSettings::from(dispatcher)) {
                Ok(notifier) => {
                    info!("Notification dispatcher created");
                    return Arc::new(notifier);
                }
                Err(e) => warn!(error = %e, "Failed to create notification dispatcher"),
            }
        }
        Arc::new(NoopNotifier::new())
    }

    /// Places an order and escrows its funds.
    pub async fn place_order(&self, request: &OrderRequest) -> settlement::Result<Order> {
        self.engine.place_order(request).await
    }

    /// Reserves order capacity for a fill.
    pub async fn reserve_slot(&self, request: &FillRequest) -> settlement::Result<SlotReservation> {
        let result = self.reservations.reserve_slot(request).await;
        match result {
            Ok(_) => self.counters.incr(Counter::Reservation),
            Err(ref e) => {
                if let Some(reason) = e.reason() {
                    self.counters.incr(Counter::Rejection);
                    debug!(order_id = %request.order_id, reason = %reason, "Reservation rejected");
                }
            }
        }
        result
    }

    /// Settles a wallet-funded awaiting.
    pub async fn settle_fill(&self, awaiting_id: &str) -> settlement::Result<SettleOutcome> {
        self.engine.settle_fill(awaiting_id).await
    }

    /// Cancels an order on behalf of its owner.
    pub async fn cancel_order(&self, order_id: &str, owner_id: &str) -> settlement::Result<Order> {
        self.engine.cancel_order(order_id, owner_id).await
    }

    /// Gives an abandoned reservation back to its order.
    pub async fn release_reservation(&self, awaiting_id: &str) -> settlement::Result<bool> {
        self.reservations.release_reservation(awaiting_id).await
    }

    pub async fn handle_deposit_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookAck, WebhookError> {
        self.pipeline.handle_deposit_webhook(body, signature).await
    }

    pub async fn handle_payment_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookAck, WebhookError> {
        self.pipeline.handle_payment_webhook(body, signature).await
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Returns true if the service loop is running.
    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Returns how long the service has been running.
    pub async fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .await
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Runs the background loop until [`FillService::stop`] is called.
    pub async fn start(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.lock().await;
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }
        *self.started_at.lock().await = Some(Instant::now());

        let Some(mut actions) = self.actions.lock().await.take() else {
            return Err(ServiceError::Config("scheduler receiver already taken".into()));
        };

        info!(
            name = %self.cfg.app.name,
            env = %self.cfg.app.env,
            ledger = ?self.cfg.ledger.provider,
            payments = self.cfg.payments.as_ref().is_some_and(|p| p.enabled),
            "Starting fill service"
        );

        let result = self.run_main_loop(&mut actions).await;
        *self.actions.lock().await = Some(actions);

        if let Err(e) = self.notifier.close().await {
            warn!(error = %e, "Failed to flush notifications on shutdown");
        }
        self.log_stats();
        self.storage.close().await;
        info!(uptime = ?self.uptime().await, "Fill service stopped");
        result
    }

    /// Signals the background loop to stop. The loop flushes notifications
    /// and closes storage on its way out.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }
        *running = false;
        info!("Stopping fill service...");
        self.shutdown.notify_one();
    }

    async fn run_main_loop(
        &self,
        actions: &mut mpsc::Receiver<ScheduledAction>,
    ) -> Result<(), ServiceError> {
        let settlement = &self.cfg.settlement;
        let mut retry_timer = tokio::time::interval(settlement.retry_poll_interval());
        let mut sweep_timer = tokio::time::interval(settlement.expiry_sweep_interval());
        let mut stats_timer = tokio::time::interval(settlement.stats_interval());
        // The first tick of an interval completes immediately.
        stats_timer.tick().await;

        info!(
            retry_poll_interval = ?settlement.retry_poll_interval(),
            expiry_sweep_interval = ?settlement.expiry_sweep_interval(),
            stats_interval = ?settlement.stats_interval(),
            reservation_ttl = ?settlement.reservation_ttl(),
            "Starting service loop"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                Some(action) = actions.recv() => {
                    if let Err(e) = self.pipeline.handle_scheduled(action.clone()).await {
                        error!(action = ?action, error = %e, "Scheduled action failed");
                    }
                }
                _ = retry_timer.tick() => {
                    if let Err(e) = self.engine.drain_retry_queue().await {
                        error!(error = %e, "Retry queue drain failed");
                    }
                }
                _ = sweep_timer.tick() => {
                    if let Err(e) = self.pipeline.sweep_expired().await {
                        error!(error = %e, "Expiry sweep failed");
                    }
                }
                _ = stats_timer.tick() => self.log_stats(),
            }
        }

        Ok(())
    }

    fn log_stats(&self) {
        let stats = self.stats();
        info!(
            reservations = stats.reservations,
            rejections = stats.rejections,
            fills_settled = stats.fills_settled,
            conflicts_retried = stats.conflicts_retried,
            fills_queued = stats.fills_queued,
            events_processed = stats.events_processed,
            duplicate_events = stats.duplicate_events,
            refunds = stats.refunds,
            expiries = stats.expiries,
            reconciliation_gaps = stats.reconciliation_gaps,
            "Service statistics"
        );
    }
}
