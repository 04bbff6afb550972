//! Engine orchestration and plugin lifecycle.
//!
//! The [`EventEngine`] wires the pieces together: it initializes
//! transport plugins (excluding any that fail), caches their
//! capabilities, implements the [`Callbacks`] contract they invoke, and
//! creates/destroys dispatchers as connections and subscriptions come
//! and go.
//!
//! # Plugin lifecycle
//!
//! `init_config` then `init` run once per registered plugin before any
//! connection activity. `capabilities` is read once, immediately after a
//! successful `init`, and cached for the plugin's lifetime. A failed
//! `init` excludes the plugin from dispatch for the process lifetime;
//! it is the only error class escalated to the engine's caller. All
//! transport-facing failures afterwards stay local to the affected
//! connection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::{ConfigSection, DispatchConfig};
use crate::dispatcher::DispatchContext;
use crate::error::EventsError;
use crate::metrics::DispatchMetrics;
use crate::plugin::{Callbacks, Capabilities, Plugin, SubscriptionMatcher};
use crate::registry::ConnectionRegistry;
use crate::source::EventSource;
use crate::store::SubscriptionStore;
use crate::subscription::{
    EventDeliveryResponse, Subscription, SubscriptionFilter, SubscriptionOptions,
};

enum PluginSlot {
    /// Registered, not yet initialized.
    Registered(Box<dyn Plugin>),
    /// Initialized and serving dispatch.
    Ready {
        plugin: Arc<dyn Plugin>,
        capabilities: Capabilities,
    },
    /// Initialization failed; excluded for the process lifetime.
    Failed,
}

/// The subscription dispatch engine.
///
/// Constructed with [`new`](Self::new), loaded with plugins via
/// [`register_plugin`](Self::register_plugin), then started with
/// [`init`](Self::init). The engine is shared as an `Arc`; each plugin
/// receives a [`Callbacks`] handle bound to it.
pub struct EventEngine {
    plugins: RwLock<HashMap<String, PluginSlot>>,
    registry: ConnectionRegistry,
    store: Arc<dyn SubscriptionStore>,
    source: Arc<dyn EventSource>,
    config: DispatchConfig,
    metrics: Arc<DispatchMetrics>,
}

impl EventEngine {
    /// Creates an engine over the given store and event source.
    #[must_use]
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        source: Arc<dyn EventSource>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            plugins: RwLock::new(HashMap::new()),
            registry: ConnectionRegistry::new(),
            store,
            source,
            config,
            metrics: Arc::new(DispatchMetrics::default()),
        })
    }

    /// Registers a transport plugin. Must be called before
    /// [`init`](Self::init); a plugin registered under an existing name
    /// replaces it.
    pub fn register_plugin(&self, plugin: Box<dyn Plugin>) {
        let name = plugin.name().to_string();
        let previous = self
            .plugins
            .write()
            .insert(name.clone(), PluginSlot::Registered(plugin));
        if previous.is_some() {
            tracing::warn!(plugin = %name, "replaced an already-registered plugin");
        }
    }

    /// Initializes every registered plugin: `init_config`, `init`,
    /// capability caching, and handler binding, in that order.
    ///
    /// Each plugin reads its own sub-section of `config` (keyed by
    /// plugin name). Plugins that fail are excluded from dispatch but do
    /// not stop the others from initializing.
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure, after all plugins have
    /// been attempted, so the operator sees it at startup.
    pub async fn init(self: &Arc<Self>, config: &ConfigSection) -> Result<(), EventsError> {
        let pending: Vec<(String, Box<dyn Plugin>)> = {
            let mut plugins = self.plugins.write();
            let names: Vec<String> = plugins.keys().cloned().collect();
            names
                .into_iter()
                .filter_map(|name| match plugins.remove(&name) {
                    Some(PluginSlot::Registered(plugin)) => Some((name, plugin)),
                    Some(other) => {
                        plugins.insert(name, other);
                        None
                    }
                    None => None,
                })
                .collect()
        };

        let mut first_error = None;
        for (name, mut plugin) in pending {
            let mut section = config.sub_section(&name);
            plugin.init_config(&mut section);
            section.apply_defaults();

            match plugin.init(&section).await {
                Ok(()) => {
                    let capabilities = plugin.capabilities();
                    let callbacks = Arc::new(PluginCallbacks {
                        engine: Arc::downgrade(self),
                        plugin: name.clone(),
                    });
                    if let Err(e) = plugin.set_handler("", callbacks) {
                        tracing::error!(
                            plugin = %name,
                            error = %e,
                            "plugin rejected its callbacks handler, excluded from dispatch"
                        );
                        self.plugins.write().insert(name, PluginSlot::Failed);
                        first_error.get_or_insert(e);
                        continue;
                    }
                    tracing::debug!(plugin = %name, ?capabilities, "plugin initialized");
                    self.plugins.write().insert(
                        name,
                        PluginSlot::Ready {
                            plugin: Arc::from(plugin),
                            capabilities,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(
                        plugin = %name,
                        error = %e,
                        "plugin initialization failed, excluded from dispatch"
                    );
                    let err = match e {
                        EventsError::PluginInit { .. } => e,
                        other => EventsError::PluginInit {
                            plugin: name.clone(),
                            message: other.to_string(),
                        },
                    };
                    self.plugins.write().insert(name, PluginSlot::Failed);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the shared dispatch counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Returns the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn ready(&self, name: &str) -> Result<(Arc<dyn Plugin>, Capabilities), EventsError> {
        match self.plugins.read().get(name) {
            Some(PluginSlot::Ready {
                plugin,
                capabilities,
            }) => Ok((Arc::clone(plugin), *capabilities)),
            Some(_) => Err(EventsError::PluginNotInitialized(name.to_string())),
            None => Err(EventsError::UnknownTransport(name.to_string())),
        }
    }

    fn dispatch_context(&self, plugin_name: &str) -> Result<DispatchContext, EventsError> {
        let (plugin, capabilities) = self.ready(plugin_name)?;
        Ok(DispatchContext {
            plugin,
            capabilities,
            store: Arc::clone(&self.store),
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Registers (or re-registers) a connection owned by `plugin_name`.
    ///
    /// See [`Callbacks::register_connection`] for the idempotency
    /// contract.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin is not initialized or the store
    /// cannot be listed.
    pub async fn register_connection(
        &self,
        plugin_name: &str,
        conn_id: &str,
        matcher: SubscriptionMatcher,
    ) -> Result<(), EventsError> {
        let ctx = self.dispatch_context(plugin_name)?;
        let candidates: Vec<Subscription> = self
            .store
            .list(None)
            .await?
            .into_iter()
            .filter(|sub| sub.transport == plugin_name && !sub.ephemeral)
            .collect();
        self.registry
            .sync_connection(conn_id, plugin_name, matcher, &candidates, &ctx);
        Ok(())
    }

    /// Creates an ephemeral subscription owned by `conn_id` on
    /// `plugin_name`'s transport.
    ///
    /// Options pass through the plugin's validation (and any
    /// normalization) first. The subscription never reaches the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin is not initialized, the options
    /// fail validation, or the connection is not registered.
    pub async fn ephemeral_subscription(
        &self,
        plugin_name: &str,
        conn_id: &str,
        namespace: &str,
        filter: SubscriptionFilter,
        mut options: SubscriptionOptions,
    ) -> Result<(), EventsError> {
        let ctx = self.dispatch_context(plugin_name)?;
        ctx.plugin.validate_options(&mut options).await?;
        let subscription = Subscription::ephemeral(namespace, plugin_name, filter, options);
        tracing::debug!(
            conn_id,
            subscription = %subscription.sref,
            "creating ephemeral subscription"
        );
        self.registry.add_ephemeral(conn_id, subscription, &ctx)
    }

    /// Handles a closed connection: stops and discards its dispatchers
    /// and drops its ephemeral subscriptions. Fire-and-forget; safe for
    /// unknown connections, and late callbacks for the connection are
    /// tolerated afterwards.
    pub fn connection_closed(&self, conn_id: &str) {
        self.registry.close_connection(conn_id);
    }

    /// Applies a consumer's delivery response. Fire-and-forget: a
    /// response for an unknown (connection, event) combination — which
    /// plugins may legitimately race against `connection_closed` — is
    /// dropped silently.
    pub fn delivery_response(&self, conn_id: &str, response: EventDeliveryResponse) {
        if !self.registry.route_response(conn_id, response) {
            DispatchMetrics::incr(&self.metrics.responses_dropped);
            tracing::debug!(conn_id, "dropped delivery response for unknown connection");
        }
    }

    /// Validates (and lets the owning plugin normalize) subscription
    /// options ahead of persistence. Invoked synchronously by the
    /// subscription-creation API before anything is stored.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::UnknownTransport`] /
    /// [`EventsError::PluginNotInitialized`] for an unusable transport,
    /// or the plugin's own validation error. Nothing is persisted on
    /// error.
    pub async fn validate_subscription(
        &self,
        transport: &str,
        options: &mut SubscriptionOptions,
    ) -> Result<(), EventsError> {
        let (plugin, _) = self.ready(transport)?;
        plugin.validate_options(options).await
    }

    /// Reacts to a newly persisted subscription: every live connection
    /// of its transport whose matcher accepts it gains a dispatcher.
    ///
    /// Returns the number of dispatchers started.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription's transport is unusable.
    pub fn subscription_created(&self, subscription: &Subscription) -> Result<usize, EventsError> {
        let ctx = self.dispatch_context(&subscription.transport)?;
        Ok(self.registry.offer_subscription(subscription, &ctx))
    }

    /// Reacts to a deleted subscription: stops every dispatcher serving
    /// it, across all connections. Returns the number stopped.
    pub fn subscription_deleted(&self, subscription_id: uuid::Uuid) -> usize {
        self.registry.drop_subscription(subscription_id)
    }

    /// Restarts a namespace: tears down its entire dispatcher set, then
    /// cues every initialized plugin to re-register the connections it
    /// owns that predate `start_time`. Connections that do not
    /// re-register stay orphaned for the namespace.
    pub fn restart_namespace(&self, namespace: &str, start_time: DateTime<Utc>) {
        let stopped = self.registry.drop_namespace(namespace);
        tracing::debug!(namespace, stopped, "namespace restarted, dispatchers dropped");

        let ready: Vec<Arc<dyn Plugin>> = self
            .plugins
            .read()
            .values()
            .filter_map(|slot| match slot {
                PluginSlot::Ready { plugin, .. } => Some(Arc::clone(plugin)),
                _ => None,
            })
            .collect();
        for plugin in ready {
            plugin.namespace_restarted(namespace, start_time);
        }
    }
}

impl std::fmt::Debug for EventEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plugins = self.plugins.read();
        f.debug_struct("EventEngine")
            .field("plugins", &plugins.keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Per-plugin [`Callbacks`] binding handed out via `set_handler`.
///
/// Holds the engine weakly so the plugin→engine edge never keeps a
/// dropped engine alive; callbacks arriving after the engine is gone are
/// ignored.
struct PluginCallbacks {
    engine: Weak<EventEngine>,
    plugin: String,
}

#[async_trait]
impl Callbacks for PluginCallbacks {
    async fn register_connection(
        &self,
        conn_id: &str,
        matcher: SubscriptionMatcher,
    ) -> Result<(), EventsError> {
        let engine = self.engine.upgrade().ok_or(EventsError::EngineStopped)?;
        engine
            .register_connection(&self.plugin, conn_id, matcher)
            .await
    }

    async fn ephemeral_subscription(
        &self,
        conn_id: &str,
        namespace: &str,
        filter: SubscriptionFilter,
        options: SubscriptionOptions,
    ) -> Result<(), EventsError> {
        let engine = self.engine.upgrade().ok_or(EventsError::EngineStopped)?;
        engine
            .ephemeral_subscription(&self.plugin, conn_id, namespace, filter, options)
            .await
    }

    fn connection_closed(&self, conn_id: &str) {
        if let Some(engine) = self.engine.upgrade() {
            engine.connection_closed(conn_id);
        }
    }

    fn delivery_response(&self, conn_id: &str, response: EventDeliveryResponse) {
        if let Some(engine) = self.engine.upgrade() {
            engine.delivery_response(conn_id, response);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::{
        mock_plugin, wait_for_offset, MemoryEventSource, MemorySubscriptionStore, MockDelivery,
        MockPluginHandle,
    };

    const NS: &str = "ns1";

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            retry_initial_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            batch_timeout: Duration::ZERO,
            ..DispatchConfig::default()
        }
    }

    struct Fixture {
        engine: Arc<EventEngine>,
        plugin: MockPluginHandle,
        store: Arc<MemorySubscriptionStore>,
        source: Arc<MemoryEventSource>,
    }

    async fn fixture(batch_capable: bool) -> Fixture {
        let store = Arc::new(MemorySubscriptionStore::new());
        let source = Arc::new(MemoryEventSource::new());
        let engine = EventEngine::new(
            Arc::clone(&store) as Arc<dyn SubscriptionStore>,
            Arc::clone(&source) as Arc<dyn EventSource>,
            test_config(),
        );

        let (plugin, handle) = mock_plugin("mock");
        if batch_capable {
            handle
                .shared
                .set_capabilities(Capabilities::default().with_batch_delivery());
        }
        engine.register_plugin(Box::new(plugin));
        engine.init(&ConfigSection::new("events")).await.unwrap();

        Fixture {
            engine,
            plugin: handle,
            store,
            source,
        }
    }

    async fn durable_sub(f: &Fixture, name: &str, options: SubscriptionOptions) -> Subscription {
        let sub = Subscription::new(NS, name, "mock", SubscriptionFilter::default(), options);
        f.store.create(&sub).await.unwrap();
        sub
    }

    fn ack_for(delivery: &MockDelivery) -> EventDeliveryResponse {
        match delivery {
            MockDelivery::Single { event, .. } => EventDeliveryResponse::ack(event),
            MockDelivery::Batch { batch, .. } => {
                let sref = batch.events[0].event.subscription.clone();
                EventDeliveryResponse::ack_batch(sref, batch.id)
            }
        }
    }

    fn match_all() -> SubscriptionMatcher {
        Arc::new(|_| true)
    }

    // --- Plugin lifecycle ---

    #[tokio::test]
    async fn test_engine_init_lifecycle() {
        let f = fixture(false).await;

        assert_eq!(f.plugin.shared.init_config_calls(), 1);
        assert_eq!(f.plugin.shared.init_calls(), 1);
        // A handler was bound for all namespaces.
        assert!(f.plugin.shared.handler().is_some());
        assert_eq!(f.plugin.shared.handler_namespaces(), vec![String::new()]);
    }

    #[tokio::test]
    async fn test_engine_init_failure_excludes_plugin() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let source = Arc::new(MemoryEventSource::new());
        let engine = EventEngine::new(
            Arc::clone(&store) as Arc<dyn SubscriptionStore>,
            source as Arc<dyn EventSource>,
            test_config(),
        );

        let (good, good_handle) = mock_plugin("good");
        let (bad, bad_handle) = mock_plugin("bad");
        bad_handle.shared.fail_init("port in use");
        engine.register_plugin(Box::new(good));
        engine.register_plugin(Box::new(bad));

        // The failure surfaces at startup...
        let err = engine.init(&ConfigSection::new("events")).await.unwrap_err();
        assert!(matches!(err, EventsError::PluginInit { .. }));

        // ...but init_config still ran for both, the good plugin serves
        // dispatch, and the bad one is excluded.
        assert_eq!(bad_handle.shared.init_config_calls(), 1);
        assert!(good_handle.shared.handler().is_some());
        assert!(engine
            .register_connection("good", "conn1", match_all())
            .await
            .is_ok());
        assert!(matches!(
            engine.register_connection("bad", "conn2", match_all()).await,
            Err(EventsError::PluginNotInitialized(_))
        ));
        assert!(matches!(
            engine.register_connection("ghost", "conn3", match_all()).await,
            Err(EventsError::UnknownTransport(_))
        ));
    }

    // --- End-to-end: ordered delivery, gap-hold (spec scenario) ---

    #[tokio::test]
    async fn test_engine_end_to_end_gap_hold() {
        let mut f = fixture(false).await;
        let sub = durable_sub(&f, "app1", SubscriptionOptions::default()).await;
        for _ in 0..3 {
            f.source.append(NS, "message_confirmed", None);
        }

        // Drive registration through the handler the plugin was given,
        // exactly as a transport would.
        let callbacks = f.plugin.shared.handler().unwrap();
        callbacks
            .register_connection("conn1", match_all())
            .await
            .unwrap();

        let d1 = f.plugin.recv().await;
        let d2 = f.plugin.recv().await;
        let d3 = f.plugin.recv().await;
        for (d, expected) in [(&d1, 1u64), (&d2, 2), (&d3, 3)] {
            let MockDelivery::Single { event, conn_id, .. } = d else {
                panic!("expected single delivery");
            };
            assert_eq!(event.event.sequence, expected);
            assert_eq!(conn_id, "conn1");
        }

        callbacks.delivery_response("conn1", ack_for(&d1));
        wait_for_offset(&f.store, sub.sref.id, 1).await;

        callbacks.delivery_response("conn1", ack_for(&d3));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.store.committed_offset(sub.sref.id).await.unwrap(), 1);

        callbacks.delivery_response("conn1", ack_for(&d2));
        wait_for_offset(&f.store, sub.sref.id, 3).await;
    }

    // --- End-to-end: batch reject (spec scenario) ---

    #[tokio::test]
    async fn test_engine_end_to_end_batch_reject() {
        let mut f = fixture(true).await;
        let options = SubscriptionOptions {
            batch: true,
            ..SubscriptionOptions::default()
        };
        let sub = durable_sub(&f, "app1", options).await;
        for _ in 0..3 {
            f.source.append(NS, "message_confirmed", None);
        }

        f.engine
            .register_connection("mock", "conn1", match_all())
            .await
            .unwrap();

        let MockDelivery::Batch { batch, .. } = f.plugin.recv().await else {
            panic!("expected batch delivery");
        };
        assert_eq!(batch.events.len(), 3);

        f.engine.delivery_response(
            "conn1",
            EventDeliveryResponse::reject_batch(sub.sref.clone(), batch.id, "replay please"),
        );

        // Offset stays put and the same batch comes back whole.
        let MockDelivery::Batch { batch: again, .. } = f.plugin.recv().await else {
            panic!("expected batch redelivery");
        };
        let seqs: Vec<u64> = again.events.iter().map(|e| e.event.event.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(f.store.committed_offset(sub.sref.id).await.unwrap(), 0);
    }

    // --- Idempotent registration ---

    #[tokio::test]
    async fn test_engine_register_connection_idempotent() {
        let f = fixture(false).await;
        let a = durable_sub(&f, "a", SubscriptionOptions::default()).await;
        let b = durable_sub(&f, "b", SubscriptionOptions::default()).await;

        f.engine
            .register_connection("mock", "conn1", match_all())
            .await
            .unwrap();
        assert_eq!(f.engine.registry().dispatcher_count("conn1"), 2);

        // Same connection, narrower matcher: "b" is stopped, "a" kept,
        // nothing duplicated.
        f.engine
            .register_connection("mock", "conn1", Arc::new(|sref| sref.name == "a"))
            .await
            .unwrap();
        assert_eq!(f.engine.registry().dispatcher_count("conn1"), 1);
        assert!(f.engine.registry().has_dispatcher("conn1", a.sref.id));
        assert!(!f.engine.registry().has_dispatcher("conn1", b.sref.id));
    }

    // --- Connection close races ---

    #[tokio::test]
    async fn test_engine_connection_closed_then_late_response() {
        let mut f = fixture(false).await;
        let sub = durable_sub(&f, "app1", SubscriptionOptions::default()).await;
        f.source.append(NS, "message_confirmed", None);

        f.engine
            .register_connection("mock", "conn1", match_all())
            .await
            .unwrap();
        let delivery = f.plugin.recv().await;

        let callbacks = f.plugin.shared.handler().unwrap();
        callbacks.connection_closed("conn1");

        // The transport races an in-flight response past the close: it
        // is dropped without error and nothing is committed.
        callbacks.delivery_response("conn1", ack_for(&delivery));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.engine.metrics().responses_dropped() >= 1);
        assert_eq!(f.store.committed_offset(sub.sref.id).await.unwrap(), 0);

        // Closing again is harmless too.
        callbacks.connection_closed("conn1");
    }

    #[tokio::test]
    async fn test_engine_response_for_unknown_connection_dropped() {
        let f = fixture(false).await;
        let sub = durable_sub(&f, "app1", SubscriptionOptions::default()).await;

        f.engine.delivery_response(
            "never-registered",
            EventDeliveryResponse::ack_batch(sub.sref.clone(), uuid::Uuid::new_v4()),
        );
        assert_eq!(f.engine.metrics().responses_dropped(), 1);
    }

    // --- Ephemeral subscriptions ---

    #[tokio::test]
    async fn test_engine_ephemeral_lifecycle() {
        let mut f = fixture(false).await;

        let callbacks = f.plugin.shared.handler().unwrap();
        callbacks
            .register_connection("conn1", Arc::new(|_| false))
            .await
            .unwrap();
        callbacks
            .ephemeral_subscription(
                "conn1",
                NS,
                SubscriptionFilter::default(),
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(f.engine.registry().dispatcher_count("conn1"), 1);

        // Never persisted.
        assert!(f.store.list(None).await.unwrap().is_empty());

        // Events appended after creation flow to the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.source.append(NS, "message_confirmed", None);
        let delivery = f.plugin.recv().await;
        callbacks.delivery_response("conn1", ack_for(&delivery));

        // Gone with the connection.
        callbacks.connection_closed("conn1");
        assert_eq!(f.engine.registry().connection_count(), 0);
        f.source.append(NS, "message_confirmed", None);
        assert!(f
            .plugin
            .try_recv_within(Duration::from_millis(100))
            .await
            .is_none());
        assert!(f.store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_ephemeral_requires_registered_connection() {
        let f = fixture(false).await;
        let err = f
            .engine
            .ephemeral_subscription(
                "mock",
                "ghost",
                NS,
                SubscriptionFilter::default(),
                SubscriptionOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventsError::UnknownConnection(_)));
    }

    // --- Subscription lifecycle hooks ---

    #[tokio::test]
    async fn test_engine_subscription_created_and_deleted() {
        let mut f = fixture(false).await;
        f.engine
            .register_connection("mock", "conn1", match_all())
            .await
            .unwrap();
        assert_eq!(f.engine.registry().dispatcher_count("conn1"), 0);

        // The external API persists, then notifies the engine.
        let sub = durable_sub(&f, "app1", SubscriptionOptions::default()).await;
        assert_eq!(f.engine.subscription_created(&sub).unwrap(), 1);
        assert!(f.engine.registry().has_dispatcher("conn1", sub.sref.id));

        f.source.append(NS, "message_confirmed", None);
        let delivery = f.plugin.recv().await;
        f.engine.delivery_response("conn1", ack_for(&delivery));
        wait_for_offset(&f.store, sub.sref.id, 1).await;

        // Deletion stops the dispatcher everywhere.
        assert_eq!(f.engine.subscription_deleted(sub.sref.id), 1);
        assert!(!f.engine.registry().has_dispatcher("conn1", sub.sref.id));
        f.source.append(NS, "message_confirmed", None);
        assert!(f
            .plugin
            .try_recv_within(Duration::from_millis(100))
            .await
            .is_none());
    }

    // --- Option validation ---

    #[tokio::test]
    async fn test_engine_validate_subscription() {
        let f = fixture(false).await;
        f.plugin.shared.force_with_data(true);

        let mut options = SubscriptionOptions::default();
        f.engine
            .validate_subscription("mock", &mut options)
            .await
            .unwrap();
        // The plugin normalized the options before persistence.
        assert!(options.with_data);

        f.plugin.shared.fail_validate("not supported");
        let err = f
            .engine
            .validate_subscription("mock", &mut options)
            .await
            .unwrap_err();
        assert!(matches!(err, EventsError::InvalidOptions(_)));

        assert!(matches!(
            f.engine.validate_subscription("amqp", &mut options).await,
            Err(EventsError::UnknownTransport(_))
        ));
    }

    // --- Namespace restart ---

    #[tokio::test]
    async fn test_engine_namespace_restart() {
        let f = fixture(false).await;
        let sub = durable_sub(&f, "app1", SubscriptionOptions::default()).await;
        let other = Subscription::new(
            "ns2",
            "app2",
            "mock",
            SubscriptionFilter::default(),
            SubscriptionOptions::default(),
        );
        f.store.create(&other).await.unwrap();

        f.engine
            .register_connection("mock", "conn1", match_all())
            .await
            .unwrap();
        assert_eq!(f.engine.registry().dispatcher_count("conn1"), 2);

        let start_time = Utc::now();
        f.engine.restart_namespace(NS, start_time);

        // The namespace's dispatchers are gone; the connection and the
        // other namespace's dispatcher survive; the plugin got its cue
        // to re-register.
        assert_eq!(f.engine.registry().connection_count(), 1);
        assert!(!f.engine.registry().has_dispatcher("conn1", sub.sref.id));
        assert!(f.engine.registry().has_dispatcher("conn1", other.sref.id));
        assert_eq!(
            f.plugin.shared.namespace_restarts(),
            vec![(NS.to_string(), start_time)]
        );

        // Re-registration rebuilds the namespace's dispatcher set.
        f.engine
            .register_connection("mock", "conn1", match_all())
            .await
            .unwrap();
        assert!(f.engine.registry().has_dispatcher("conn1", sub.sref.id));
    }
}
