//! One-shot delayed actions keyed by a caller-chosen string.
//!
//! Scheduling the same key twice replaces the earlier timer; cancelling an
//! unknown key is a no-op. Fired actions are delivered on a channel that the
//! service loop drains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// ScheduledAction is the payload delivered when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledAction {
    /// Expire a PENDING awaiting and release its reservation.
    ExpireAwaiting(String),
}

/// Scheduler is the delayed-task dispatcher consumed by the core.
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, key: &str, action: ScheduledAction, delay: Duration);

    /// Returns true if a pending timer was cancelled.
    fn cancel(&self, key: &str) -> bool;
}

/// TokioScheduler runs each timer as a sleeping tokio task.
pub struct TokioScheduler {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    sender: mpsc::Sender<ScheduledAction>,
}

impl TokioScheduler {
    /// Returns the scheduler and the receiver fired actions arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScheduledAction>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                tasks: Arc::new(Mutex::new(HashMap::new())),
                sender,
            },
            receiver,
        )
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        match self.tasks.lock() {
            Ok(tasks) => tasks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, key: &str, action: ScheduledAction, delay: Duration) {
        let sender = self.sender.clone();
        let tasks = Arc::clone(&self.tasks);
        let owned_key = key.to_string();

        let mut guard = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // The task removes its own entry, so it must not run before the
        // entry exists; holding the lock across spawn guarantees that.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut tasks) = tasks.lock() {
                tasks.remove(&owned_key);
            }
            debug!(key = %owned_key, "Scheduled action fired");
            if sender.send(action).await.is_err() {
                warn!(key = %owned_key, "Scheduled action dropped, receiver closed");
            }
        });

        if let Some(previous) = guard.insert(key.to_string(), handle) {
            previous.abort();
        }
        debug!(key, delay_ms = delay.as_millis() as u64, "Action scheduled");
    }

    fn cancel(&self, key: &str) -> bool {
        let mut guard = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.remove(key) {
            Some(handle) => {
                handle.abort();
                debug!(key, "Scheduled action cancelled");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests;
