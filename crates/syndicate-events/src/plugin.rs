//! Transport plugin and engine callback contracts.
//!
//! Two independent polymorphic contracts, wired together by explicit
//! registration rather than inheritance:
//!
//! - [`Plugin`] is implemented once per transport (socket push, webhook
//!   callback, broker bridge) and physically moves events to consumers.
//! - [`Callbacks`] is implemented by the engine and handed to every
//!   plugin via [`Plugin::set_handler`]; plugins invoke it to register
//!   connections, create ephemeral subscriptions, and report delivery
//!   outcomes.
//!
//! # Lifecycle
//!
//! 1. `init_config()` — declare recognized keys; called for every
//!    registered plugin, enabled or not.
//! 2. `init()` — connect/listen; an error excludes the plugin from
//!    dispatch for the process lifetime.
//! 3. `capabilities()` — read once, immediately after `init`; immutable
//!    for the plugin's lifetime.
//! 4. `set_handler()` — receives the engine's [`Callbacks`].
//! 5. Connection activity: `delivery_request` / `batch_delivery_request`
//!    calls from dispatchers, callback invocations from the transport.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ConfigSection;
use crate::error::EventsError;
use crate::subscription::{
    EventBatch, EventDelivery, EventDeliveryResponse, SubscriptionFilter, SubscriptionOptions,
    SubscriptionRef,
};

/// Predicate deciding whether a subscription is eligible to receive
/// events on a given connection.
///
/// Supplied per connection at registration. Must be side-effect free and
/// fast: it runs synchronously on the registering task, once per
/// candidate subscription, on every registration.
pub type SubscriptionMatcher = Arc<dyn Fn(&SubscriptionRef) -> bool + Send + Sync>;

/// Capabilities declared by a transport plugin.
///
/// Read once after `init` and fixed for the plugin's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the transport can deliver batches of events as one unit.
    pub batch_delivery: bool,
}

impl Capabilities {
    /// Enables batch delivery.
    #[must_use]
    pub fn with_batch_delivery(mut self) -> Self {
        self.batch_delivery = true;
        self
    }
}

/// A transport plugin: delivers events to consumers and reports delivery
/// outcomes back through [`Callbacks`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Returns the plugin's registered name (e.g. `websockets`).
    fn name(&self) -> &str;

    /// Declares the configuration keys this plugin recognizes, with
    /// defaults. Called once, before [`init`](Self::init), for every
    /// registered plugin regardless of whether it will be enabled.
    fn init_config(&mut self, section: &mut ConfigSection);

    /// Initializes the plugin with its configuration.
    ///
    /// # Errors
    ///
    /// An error is fatal for this plugin: it is excluded from dispatch
    /// for the lifetime of the process.
    async fn init(&mut self, section: &ConfigSection) -> Result<(), EventsError>;

    /// Binds the [`Callbacks`] implementation the plugin must invoke.
    ///
    /// May be called once per namespace, or with an empty namespace to
    /// mean "all namespaces".
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be bound (e.g. a namespace
    /// the plugin is not serving).
    fn set_handler(
        &mut self,
        namespace: &str,
        handler: Arc<dyn Callbacks>,
    ) -> Result<(), EventsError>;

    /// Returns the plugin's capabilities. Valid only after
    /// [`init`](Self::init).
    fn capabilities(&self) -> Capabilities;

    /// Verifies a set of subscription options prior to persistence.
    ///
    /// The plugin may normalize the options, such as overriding whether
    /// data is delivered.
    ///
    /// # Errors
    ///
    /// An error rejects the subscription creation request; nothing is
    /// persisted.
    async fn validate_options(
        &self,
        options: &mut SubscriptionOptions,
    ) -> Result<(), EventsError>;

    /// Requests delivery of one event on a connection; the consumer
    /// responds later via [`Callbacks::delivery_response`].
    ///
    /// `data` is only supplied when the subscription requests data
    /// delivery.
    ///
    /// # Errors
    ///
    /// A transport failure; the owning dispatcher retries with backoff
    /// and the committed offset is untouched.
    async fn delivery_request(
        &self,
        conn_id: &str,
        subscription: &SubscriptionRef,
        event: &EventDelivery,
        data: Option<&Value>,
    ) -> Result<(), EventsError>;

    /// Requests delivery of a batch of events on a connection, responded
    /// to as one unit referencing the batch ID.
    ///
    /// Only invoked when [`Capabilities::batch_delivery`] is set and the
    /// subscription allows batching.
    ///
    /// # Errors
    ///
    /// As for [`delivery_request`](Self::delivery_request).
    async fn batch_delivery_request(
        &self,
        conn_id: &str,
        subscription: &SubscriptionRef,
        batch: &EventBatch,
    ) -> Result<(), EventsError>;

    /// Notifies the plugin that a namespace restarted at `start_time`.
    ///
    /// The engine's dispatcher set for that namespace was rebuilt from
    /// scratch; the plugin must re-register every connection it owns that
    /// was established before `start_time`. Connections not re-registered
    /// stay orphaned for that namespace.
    fn namespace_restarted(&self, namespace: &str, start_time: DateTime<Utc>);
}

/// Engine-side contract invoked by transport plugins.
#[async_trait]
pub trait Callbacks: Send + Sync {
    /// Registers (or re-registers) a connection with a matcher.
    ///
    /// Idempotent per connection ID: calling it again replaces the
    /// connection's subscription list — the matcher is re-evaluated
    /// against all current subscriptions, dispatchers are started for new
    /// matches and stopped for subscriptions that no longer match, and no
    /// dispatcher is ever duplicated for an existing (connection,
    /// subscription) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the owning plugin is not initialized or the
    /// subscription store cannot be read.
    async fn register_connection(
        &self,
        conn_id: &str,
        matcher: SubscriptionMatcher,
    ) -> Result<(), EventsError>;

    /// Creates a non-durable subscription owned by a connection.
    ///
    /// The subscription never reaches the store; its offset starts at the
    /// namespace's current head and lives only in its dispatcher. It is
    /// dropped automatically when the connection closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered or the
    /// options fail validation.
    async fn ephemeral_subscription(
        &self,
        conn_id: &str,
        namespace: &str,
        filter: SubscriptionFilter,
        options: SubscriptionOptions,
    ) -> Result<(), EventsError>;

    /// Notifies that a connection has closed. Fire-and-forget: never
    /// rejected, safe to call for unknown connections, and the engine
    /// tolerates further callbacks for the closed connection arriving
    /// afterwards.
    fn connection_closed(&self, conn_id: &str);

    /// Responds to a prior delivery: acknowledge (the subscription's
    /// offset may advance once all gaps before it fill) or reject (the
    /// subscription rewinds to its last committed offset and redelivers).
    ///
    /// Fire-and-forget: responses for unknown (connection, event)
    /// combinations are dropped silently.
    fn delivery_response(&self, conn_id: &str, response: EventDeliveryResponse);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_default() {
        let caps = Capabilities::default();
        assert!(!caps.batch_delivery);
    }

    #[test]
    fn test_capabilities_builder() {
        let caps = Capabilities::default().with_batch_delivery();
        assert!(caps.batch_delivery);
    }

    #[test]
    fn test_matcher_is_object_safe() {
        let matcher: SubscriptionMatcher = Arc::new(|sref| sref.name == "app1");
        let sref = SubscriptionRef {
            id: uuid::Uuid::new_v4(),
            namespace: "ns1".into(),
            name: "app1".into(),
        };
        assert!(matcher(&sref));
    }
}
