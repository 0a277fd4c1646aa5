//! Runtime statistics for the fill service.

use std::sync::atomic::{AtomicU64, Ordering};

/// Events the service counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Reservation,
    Rejection,
    FillSettled,
    ConflictRetried,
    FillQueued,
    EventProcessed,
    DuplicateEvent,
    Refund,
    Expiry,
    ReconciliationGap,
}

/// Lock-free counters shared by every component.
#[derive(Debug, Default)]
pub struct Counters {
    reservations: AtomicU64,
    rejections: AtomicU64,
    fills_settled: AtomicU64,
    conflicts_retried: AtomicU64,
    fills_queued: AtomicU64,
    events_processed: AtomicU64,
    duplicate_events: AtomicU64,
    refunds: AtomicU64,
    expiries: AtomicU64,
    reconciliation_gaps: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Returns a copy of the current statistics.
    pub fn snapshot(&self) -> Stats {
        Stats {
            reservations: self.get(Counter::Reservation),
            rejections: self.get(Counter::Rejection),
            fills_settled: self.get(Counter::FillSettled),
            conflicts_retried: self.get(Counter::ConflictRetried),
            fills_queued: self.get(Counter::FillQueued),
            events_processed: self.get(Counter::EventProcessed),
            duplicate_events: self.get(Counter::DuplicateEvent),
            refunds: self.get(Counter::Refund),
            expiries: self.get(Counter::Expiry),
            reconciliation_gaps: self.get(Counter::ReconciliationGap),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Reservation => &self.reservations,
            Counter::Rejection => &self.rejections,
            Counter::FillSettled => &self.fills_settled,
            Counter::ConflictRetried => &self.conflicts_retried,
            Counter::FillQueued => &self.fills_queued,
            Counter::EventProcessed => &self.events_processed,
            Counter::DuplicateEvent => &self.duplicate_events,
            Counter::Refund => &self.refunds,
            Counter::Expiry => &self.expiries,
            Counter::ReconciliationGap => &self.reconciliation_gaps,
        }
    }
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub reservations: u64,
    pub rejections: u64,
    pub fills_settled: u64,
    pub conflicts_retried: u64,
    pub fills_queued: u64,
    pub events_processed: u64,
    pub duplicate_events: u64,
    pub refunds: u64,
    pub expiries: u64,
    pub reconciliation_gaps: u64,
}
