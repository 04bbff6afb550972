//! Live connection registry.
//!
//! Tracks every registered connection, its matcher, and the dispatchers
//! currently allocated to it. Registration is idempotent per connection
//! ID: re-registering replaces the subscription list — the matcher is
//! re-evaluated, new matches gain a dispatcher, stale matches lose
//! theirs, and existing (connection, subscription) pairs are left
//! untouched.
//!
//! Matchers run synchronously on the registering task, once per
//! candidate subscription. Dispatcher spawning is non-blocking, so every
//! registry operation completes without awaiting.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::dispatcher::{DispatchContext, Dispatcher, DispatcherHandle};
use crate::error::EventsError;
use crate::plugin::SubscriptionMatcher;
use crate::subscription::{EventDeliveryResponse, Subscription};

struct ConnectionEntry {
    /// Plugin that owns the connection.
    plugin_name: String,
    /// Eligibility predicate supplied at registration.
    matcher: SubscriptionMatcher,
    /// Active dispatchers, keyed by subscription ID.
    dispatchers: HashMap<Uuid, DispatcherHandle>,
    /// Ephemeral subscription IDs owned by this connection.
    ephemeral: HashSet<Uuid>,
}

/// Registry of live connections and their dispatchers.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or re-registers a connection, reconciling its
    /// dispatcher set against `candidates` (the durable subscriptions of
    /// the owning plugin).
    ///
    /// Ephemeral dispatchers are connection-scoped, not matcher-scoped,
    /// and survive re-registration. If the connection ID was previously
    /// owned by a different plugin the old registration is torn down
    /// first.
    pub fn sync_connection(
        &self,
        conn_id: &str,
        plugin_name: &str,
        matcher: SubscriptionMatcher,
        candidates: &[Subscription],
        ctx: &DispatchContext,
    ) {
        let mut connections = self.connections.write();

        let plugin_changed = connections
            .get(conn_id)
            .is_some_and(|entry| entry.plugin_name != plugin_name);
        if plugin_changed {
            if let Some(old) = connections.remove(conn_id) {
                tracing::warn!(
                    conn_id,
                    old_plugin = %old.plugin_name,
                    new_plugin = %plugin_name,
                    "connection re-registered by a different plugin, discarding old state"
                );
                for handle in old.dispatchers.values() {
                    handle.stop();
                }
            }
        }

        let entry = connections
            .entry(conn_id.to_string())
            .or_insert_with(|| ConnectionEntry {
                plugin_name: plugin_name.to_string(),
                matcher: matcher.clone(),
                dispatchers: HashMap::new(),
                ephemeral: HashSet::new(),
            });
        entry.matcher = matcher;

        let matched: HashSet<Uuid> = candidates
            .iter()
            .filter(|sub| (entry.matcher)(&sub.sref))
            .map(|sub| sub.sref.id)
            .collect();

        // Stop dispatchers for durable subscriptions that no longer match.
        let stale: Vec<Uuid> = entry
            .dispatchers
            .keys()
            .filter(|id| !matched.contains(id) && !entry.ephemeral.contains(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(handle) = entry.dispatchers.remove(&id) {
                tracing::debug!(conn_id, subscription = %handle.subscription(), "stopping unmatched dispatcher");
                handle.stop();
            }
        }

        // Start dispatchers for new matches; existing pairs are never
        // duplicated.
        for sub in candidates {
            if matched.contains(&sub.sref.id) && !entry.dispatchers.contains_key(&sub.sref.id) {
                let handle = Dispatcher::spawn(conn_id, sub.clone(), ctx.clone());
                entry.dispatchers.insert(sub.sref.id, handle);
            }
        }
    }

    /// Starts a dispatcher for an ephemeral subscription owned by
    /// `conn_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::UnknownConnection`] if the connection is
    /// not registered.
    pub fn add_ephemeral(
        &self,
        conn_id: &str,
        subscription: Subscription,
        ctx: &DispatchContext,
    ) -> Result<(), EventsError> {
        let mut connections = self.connections.write();
        let entry = connections
            .get_mut(conn_id)
            .ok_or_else(|| EventsError::UnknownConnection(conn_id.to_string()))?;

        let id = subscription.sref.id;
        let handle = Dispatcher::spawn(conn_id, subscription, ctx.clone());
        entry.dispatchers.insert(id, handle);
        entry.ephemeral.insert(id);
        Ok(())
    }

    /// Removes a connection, stopping and discarding every dispatcher it
    /// owns (ephemeral subscriptions die with it). Safe to call for
    /// unknown connections.
    ///
    /// Returns `true` if the connection was registered.
    pub fn close_connection(&self, conn_id: &str) -> bool {
        let removed = self.connections.write().remove(conn_id);
        match removed {
            Some(entry) => {
                for handle in entry.dispatchers.values() {
                    handle.stop();
                }
                tracing::debug!(
                    conn_id,
                    dispatchers = entry.dispatchers.len(),
                    "connection closed"
                );
                true
            }
            None => {
                tracing::debug!(conn_id, "close for unknown connection ignored");
                false
            }
        }
    }

    /// Routes a delivery response to the dispatcher for its
    /// (connection, subscription) pair.
    ///
    /// Returns `false` if no such dispatcher exists (unknown or closed
    /// connection, deleted subscription) or its channel is full; the
    /// response is dropped.
    pub fn route_response(&self, conn_id: &str, response: EventDeliveryResponse) -> bool {
        let connections = self.connections.read();
        let Some(entry) = connections.get(conn_id) else {
            return false;
        };
        let Some(handle) = entry.dispatchers.get(&response.subscription.id) else {
            return false;
        };
        handle.deliver_response(response)
    }

    /// Offers a newly created subscription to every live connection of
    /// its transport; connections whose matcher accepts it gain a
    /// dispatcher.
    ///
    /// Returns the number of dispatchers started.
    pub fn offer_subscription(&self, subscription: &Subscription, ctx: &DispatchContext) -> usize {
        let mut connections = self.connections.write();
        let mut started = 0;
        for (conn_id, entry) in connections.iter_mut() {
            if entry.plugin_name != subscription.transport {
                continue;
            }
            if !(entry.matcher)(&subscription.sref) {
                continue;
            }
            if entry.dispatchers.contains_key(&subscription.sref.id) {
                continue;
            }
            let handle = Dispatcher::spawn(conn_id.clone(), subscription.clone(), ctx.clone());
            entry.dispatchers.insert(subscription.sref.id, handle);
            started += 1;
        }
        started
    }

    /// Stops every dispatcher serving a deleted subscription, across all
    /// connections.
    ///
    /// Returns the number of dispatchers stopped.
    pub fn drop_subscription(&self, id: Uuid) -> usize {
        let mut connections = self.connections.write();
        let mut stopped = 0;
        for entry in connections.values_mut() {
            if let Some(handle) = entry.dispatchers.remove(&id) {
                handle.stop();
                stopped += 1;
            }
            entry.ephemeral.remove(&id);
        }
        stopped
    }

    /// Stops every dispatcher for a namespace, across all connections.
    /// Connections stay registered; a restarted namespace rebuilds its
    /// dispatcher set from plugin re-registration.
    ///
    /// Returns the number of dispatchers stopped.
    pub fn drop_namespace(&self, namespace: &str) -> usize {
        let mut connections = self.connections.write();
        let mut stopped = 0;
        for entry in connections.values_mut() {
            let doomed: Vec<Uuid> = entry
                .dispatchers
                .iter()
                .filter(|(_, handle)| handle.subscription().namespace == namespace)
                .map(|(id, _)| *id)
                .collect();
            for id in doomed {
                if let Some(handle) = entry.dispatchers.remove(&id) {
                    handle.stop();
                    stopped += 1;
                }
                entry.ephemeral.remove(&id);
            }
        }
        stopped
    }

    /// Returns the number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns the number of dispatchers allocated to a connection.
    #[must_use]
    pub fn dispatcher_count(&self, conn_id: &str) -> usize {
        self.connections
            .read()
            .get(conn_id)
            .map_or(0, |entry| entry.dispatchers.len())
    }

    /// Returns `true` if a dispatcher exists for the
    /// (connection, subscription) pair.
    #[must_use]
    pub fn has_dispatcher(&self, conn_id: &str, subscription_id: Uuid) -> bool {
        self.connections
            .read()
            .get(conn_id)
            .is_some_and(|entry| entry.dispatchers.contains_key(&subscription_id))
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let connections = self.connections.read();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &connections.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
