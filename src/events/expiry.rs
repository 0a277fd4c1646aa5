//! Reservation expiry, both scheduled and swept.

use chrono::Utc;
use tracing::{info, warn};

use super::EventPipeline;
use crate::scheduler::ScheduledAction;
use crate::service::Counter;
use crate::settlement::Result;

const SWEEP_BATCH: i64 = 100;

impl EventPipeline {
    /// Runs a fired scheduled action. Returns true if it changed anything.
    pub async fn handle_scheduled(&self, action: ScheduledAction) -> Result<bool> {
        match action {
            ScheduledAction::ExpireAwaiting(awaiting_id) => {
                let expired = self.reservations.expire_awaiting(&awaiting_id).await?;
                if expired {
                    self.counters.incr(Counter::Expiry);
                }
                Ok(expired)
            }
        }
    }

    /// Expires PENDING awaitings older than the reservation TTL whose
    /// scheduled expiry never fired, e.g. across a restart.
    pub async fn sweep_expired(&self) -> Result<u32> {
        let ttl = chrono::Duration::from_std(self.reservations.reservation_ttl())
            .unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - ttl;
        let stale = self
            .storage
            .list_stale_pending(cutoff, SWEEP_BATCH)
            .await?;

        let mut expired = 0;
        for awaiting in stale {
            match self.reservations.expire_awaiting(&awaiting.id).await {
                Ok(true) => {
                    self.counters.incr(Counter::Expiry);
                    expired += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(awaiting_id = %awaiting.id, error = %e, "Sweep failed to expire awaiting"),
            }
        }
        if expired > 0 {
            info!(expired, "Stale reservations swept");
        }
        Ok(expired)
    }
}
