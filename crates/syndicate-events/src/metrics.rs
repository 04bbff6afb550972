//! Atomic dispatch counters.
//!
//! One [`DispatchMetrics`] instance is shared across every dispatcher an
//! engine spawns; counters are monotonic and read with relaxed ordering.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for monitoring dispatch activity.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Total events delivered (singly or inside batches).
    pub events_delivered: AtomicU64,

    /// Total batch deliveries.
    pub batches_delivered: AtomicU64,

    /// Total events acknowledged.
    pub events_acknowledged: AtomicU64,

    /// Total events discarded from in-flight windows for redelivery
    /// (rejects and offset-conflict reloads).
    pub events_redelivered: AtomicU64,

    /// Total delivery attempts that failed and were retried.
    pub delivery_retries: AtomicU64,

    /// Total delivery responses dropped (unknown connection, unknown
    /// event, or arrival after connection close).
    pub responses_dropped: AtomicU64,

    /// Total committed-offset writes persisted.
    pub offset_commits: AtomicU64,

    /// Total committed-offset writes lost to a concurrent dispatcher.
    pub offset_conflicts: AtomicU64,
}

impl DispatchMetrics {
    /// Returns total events delivered.
    #[must_use]
    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    /// Returns total batch deliveries.
    #[must_use]
    pub fn batches_delivered(&self) -> u64 {
        self.batches_delivered.load(Ordering::Relaxed)
    }

    /// Returns total events acknowledged.
    #[must_use]
    pub fn events_acknowledged(&self) -> u64 {
        self.events_acknowledged.load(Ordering::Relaxed)
    }

    /// Returns total events discarded for redelivery.
    #[must_use]
    pub fn events_redelivered(&self) -> u64 {
        self.events_redelivered.load(Ordering::Relaxed)
    }

    /// Returns total retried delivery attempts.
    #[must_use]
    pub fn delivery_retries(&self) -> u64 {
        self.delivery_retries.load(Ordering::Relaxed)
    }

    /// Returns total dropped delivery responses.
    #[must_use]
    pub fn responses_dropped(&self) -> u64 {
        self.responses_dropped.load(Ordering::Relaxed)
    }

    /// Returns total persisted offset commits.
    #[must_use]
    pub fn offset_commits(&self) -> u64 {
        self.offset_commits.load(Ordering::Relaxed)
    }

    /// Returns total offset write conflicts.
    #[must_use]
    pub fn offset_conflicts(&self) -> u64 {
        self.offset_conflicts.load(Ordering::Relaxed)
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
