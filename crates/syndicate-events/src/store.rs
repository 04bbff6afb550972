//! Durable subscription store contract.
//!
//! The engine's only persisted state is the per-subscription committed
//! offset, written through [`SubscriptionStore::put_offset`] — a
//! compare-and-swap that makes overlapping dispatchers for the same
//! subscription (a brief window during reconnection) safe: the stale
//! writer fails with [`EventsError::OffsetConflict`] and must reload its
//! cursor before proceeding.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EventsError;
use crate::subscription::Subscription;

/// Durable record of subscription definitions and committed offsets.
///
/// Backed externally by a key-value or document store; the engine needs
/// only get/put/list by namespace plus the conditional offset update.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Lists durable subscriptions, optionally restricted to one
    /// namespace.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Store`] on a storage failure.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Subscription>, EventsError>;

    /// Fetches a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Store`] on a storage failure.
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, EventsError>;

    /// Persists a new subscription with a committed offset of zero.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Store`] on a storage failure.
    async fn create(&self, subscription: &Subscription) -> Result<(), EventsError>;

    /// Deletes a subscription and its offset.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Store`] on a storage failure.
    async fn delete(&self, id: Uuid) -> Result<(), EventsError>;

    /// Reads a subscription's committed offset.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::UnknownSubscription`] if the subscription
    /// does not exist, or [`EventsError::Store`] on a storage failure.
    async fn committed_offset(&self, id: Uuid) -> Result<u64, EventsError>;

    /// Conditionally advances a subscription's committed offset from
    /// `expected` to `new`.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::OffsetConflict`] if the stored offset is
    /// not `expected` (the caller must reload before proceeding),
    /// [`EventsError::UnknownSubscription`] if the subscription does not
    /// exist, or [`EventsError::Store`] on a storage failure.
    async fn put_offset(&self, id: Uuid, expected: u64, new: u64) -> Result<(), EventsError>;
}
