//! Ordered, resumable event source contract.
//!
//! The durable event log is an external collaborator; the engine needs
//! one read path from it: a strictly ordered sequence of confirmed
//! events for a namespace, resumable from any offset. Dispatchers poll
//! this contract and re-poll after an idle delay when no events are
//! available.

use async_trait::async_trait;

use crate::error::EventsError;
use crate::subscription::{EnrichedEvent, SubscriptionFilter};

/// Read access to a namespace's confirmed event log.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Reads up to `limit` events with sequence greater than `after`, in
    /// ascending sequence order, matching the subscription's filter.
    ///
    /// An empty result means no matching events are currently available;
    /// the caller polls again after a delay. `limit` is a hint —
    /// implementations may return fewer events, never more.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Source`] on a read failure.
    async fn next_events(
        &self,
        namespace: &str,
        filter: &SubscriptionFilter,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EnrichedEvent>, EventsError>;

    /// Returns the namespace's current head offset — the sequence of the
    /// newest confirmed event, or zero for an empty log.
    ///
    /// Ephemeral subscriptions start here ("now") rather than replaying
    /// history.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Source`] on a read failure.
    async fn head_offset(&self, namespace: &str) -> Result<u64, EventsError>;
}
