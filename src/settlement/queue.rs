//! Draining the durable settlement retry queue.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::fill::{Attempt, to_chrono};
use super::{Result, SettlementEngine, SettlementError};
use crate::domain::AwaitingStatus;
use crate::storage::RetryEntry;

const DRAIN_BATCH: i64 = 50;

/// What one pass over the retry queue did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub settled: u32,
    pub rescheduled: u32,
    pub failed: u32,
    /// Entries whose awaiting no longer needed settling.
    pub dropped: u32,
}

impl SettlementEngine {
    /// Retries every due queue entry once.
    pub async fn drain_retry_queue(&self) -> Result<DrainReport> {
        let due = self.storage.due_retries(Utc::now(), DRAIN_BATCH).await?;
        let mut report = DrainReport::default();

        for entry in due {
            if let Err(e) = self.retry_entry(&entry, &mut report).await {
                warn!(awaiting_id = %entry.awaiting_id, error = %e, "Retry attempt errored");
                self.reschedule(&entry, &e.to_string(), &mut report).await?;
            }
        }

        if report != DrainReport::default() {
            info!(
                settled = report.settled,
                rescheduled = report.rescheduled,
                failed = report.failed,
                dropped = report.dropped,
                "Retry queue drained"
            );
        }
        Ok(report)
    }

    async fn retry_entry(&self, entry: &RetryEntry, report: &mut DrainReport) -> Result<()> {
        let awaiting = match self.storage.get_awaiting(&entry.awaiting_id).await? {
            Some(awaiting)
                if awaiting.status == AwaitingStatus::Processing && !awaiting.fill_applied =>
            {
                awaiting
            }
            _ => {
                debug!(awaiting_id = %entry.awaiting_id, "Dropping retry entry, nothing to settle");
                self.storage.remove_retry(&entry.awaiting_id).await?;
                report.dropped += 1;
                return Ok(());
            }
        };

        match self.attempt(&awaiting).await {
            Ok(Attempt::Applied(applied)) => {
                self.storage.remove_retry(&awaiting.id).await?;
                self.complete(&awaiting, applied).await?;
                report.settled += 1;
            }
            Ok(Attempt::Conflicted { conflicts }) => {
                let cause = format!("version conflict after {} attempts", conflicts);
                self.reschedule(entry, &cause, report).await?;
            }
            Err(SettlementError::Rejected(rejection)) => {
                self.storage.remove_retry(&awaiting.id).await?;
                self.fail_claimed(&awaiting, &rejection.to_string()).await;
                report.failed += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Pushes an entry out with backoff, or fails the fill once the attempt
    /// budget is spent.
    async fn reschedule(
        &self,
        entry: &RetryEntry,
        cause: &str,
        report: &mut DrainReport,
    ) -> Result<()> {
        let attempts = entry.attempts + 1;
        if attempts >= self.config.retry_max_attempts() {
            warn!(
                awaiting_id = %entry.awaiting_id,
                attempts,
                cause,
                "Settlement retries exhausted"
            );
            self.storage.remove_retry(&entry.awaiting_id).await?;
            if let Some(awaiting) = self.storage.get_awaiting(&entry.awaiting_id).await? {
                let reason = format!("settlement retries exhausted: {}", cause);
                self.fail_claimed(&awaiting, &reason).await;
            }
            report.failed += 1;
            return Ok(());
        }

        let next = Utc::now() + to_chrono(self.config.retry_backoff(attempts + 1));
        let recorded = self
            .storage
            .reschedule_retry(&entry.awaiting_id, next, cause)
            .await?;
        debug!(
            awaiting_id = %entry.awaiting_id,
            attempts = recorded,
            next_attempt_at = %next,
            "Retry rescheduled"
        );
        report.rescheduled += 1;
        Ok(())
    }
}
