//! Testing utilities.
//!
//! Mock implementations of the three external collaborators — transport
//! plugin, subscription store, and event source — used by the engine's
//! own tests and available to downstream transports testing against the
//! dispatch contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ConfigSection;
use crate::error::EventsError;
use crate::plugin::{Callbacks, Capabilities, Plugin};
use crate::source::EventSource;
use crate::store::SubscriptionStore;
use crate::subscription::{
    EnrichedEvent, Event, EventBatch, EventDelivery, Subscription, SubscriptionFilter,
    SubscriptionOptions, SubscriptionRef,
};

// ---------------------------------------------------------------------------
// MockPlugin
// ---------------------------------------------------------------------------

/// A delivery captured by [`MockPlugin`].
#[derive(Debug)]
pub enum MockDelivery {
    /// A single-event delivery request.
    Single {
        /// Connection the delivery was requested on.
        conn_id: String,
        /// The delivery.
        event: EventDelivery,
        /// Attached data, when the subscription requests it.
        data: Option<Value>,
    },
    /// A batch delivery request.
    Batch {
        /// Connection the delivery was requested on.
        conn_id: String,
        /// The batch.
        batch: EventBatch,
    },
}

/// Shared, scriptable state behind a [`MockPlugin`].
#[derive(Default)]
pub struct MockPluginState {
    init_config_calls: AtomicUsize,
    init_calls: AtomicUsize,
    fail_init: Mutex<Option<String>>,
    fail_validate: Mutex<Option<String>>,
    force_with_data: AtomicBool,
    fail_deliveries: AtomicUsize,
    block_deliveries: AtomicBool,
    capabilities: Mutex<Capabilities>,
    handler: Mutex<Option<Arc<dyn Callbacks>>>,
    handler_namespaces: Mutex<Vec<String>>,
    namespace_restarts: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl MockPluginState {
    /// Returns how many times `init_config` was called.
    #[must_use]
    pub fn init_config_calls(&self) -> usize {
        self.init_config_calls.load(Ordering::Relaxed)
    }

    /// Returns how many times `init` was called.
    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Relaxed)
    }

    /// Makes the next `init` call fail with the given message.
    pub fn fail_init(&self, message: impl Into<String>) {
        *self.fail_init.lock() = Some(message.into());
    }

    /// Makes `validate_options` reject with the given message.
    pub fn fail_validate(&self, message: impl Into<String>) {
        *self.fail_validate.lock() = Some(message.into());
    }

    /// Makes `validate_options` normalize `with_data` to `true`.
    pub fn force_with_data(&self, force: bool) {
        self.force_with_data.store(force, Ordering::Relaxed);
    }

    /// Makes the next `n` delivery requests fail.
    pub fn fail_next_deliveries(&self, n: usize) {
        self.fail_deliveries.store(n, Ordering::Relaxed);
    }

    /// When set, delivery requests block forever (until the dispatcher
    /// is stopped).
    pub fn block_deliveries(&self, block: bool) {
        self.block_deliveries.store(block, Ordering::Relaxed);
    }

    /// Sets the capabilities the plugin reports. Call before `init`.
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.lock() = capabilities;
    }

    /// Returns the capabilities the plugin reports.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock()
    }

    /// Returns the callbacks handler bound via `set_handler`, if any.
    #[must_use]
    pub fn handler(&self) -> Option<Arc<dyn Callbacks>> {
        self.handler.lock().clone()
    }

    /// Returns the namespaces `set_handler` was called with.
    #[must_use]
    pub fn handler_namespaces(&self) -> Vec<String> {
        self.handler_namespaces.lock().clone()
    }

    /// Returns recorded `namespace_restarted` notifications.
    #[must_use]
    pub fn namespace_restarts(&self) -> Vec<(String, DateTime<Utc>)> {
        self.namespace_restarts.lock().clone()
    }
}

impl std::fmt::Debug for MockPluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPluginState")
            .field("init_config_calls", &self.init_config_calls())
            .field("init_calls", &self.init_calls())
            .field("capabilities", &self.capabilities())
            .field("has_handler", &self.handler.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Receiving side of a [`MockPlugin`]: captured deliveries plus the
/// shared scriptable state.
#[derive(Debug)]
pub struct MockPluginHandle {
    /// Scriptable plugin state.
    pub shared: Arc<MockPluginState>,
    receiver: mpsc::UnboundedReceiver<MockDelivery>,
}

impl MockPluginHandle {
    /// Waits for the next captured delivery.
    ///
    /// # Panics
    ///
    /// Panics if no delivery arrives within two seconds.
    pub async fn recv(&mut self) -> MockDelivery {
        tokio::time::timeout(Duration::from_secs(2), self.receiver.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("mock plugin dropped")
    }

    /// Waits up to `wait` for a delivery, returning `None` on timeout.
    pub async fn try_recv_within(&mut self, wait: Duration) -> Option<MockDelivery> {
        tokio::time::timeout(wait, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Scriptable transport plugin capturing every delivery request.
#[derive(Debug)]
pub struct MockPlugin {
    name: String,
    shared: Arc<MockPluginState>,
    deliveries: mpsc::UnboundedSender<MockDelivery>,
}

/// Creates a mock plugin and the handle observing it.
#[must_use]
pub fn mock_plugin(name: &str) -> (MockPlugin, MockPluginHandle) {
    let shared = Arc::new(MockPluginState::default());
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockPlugin {
            name: name.to_string(),
            shared: Arc::clone(&shared),
            deliveries: tx,
        },
        MockPluginHandle {
            shared,
            receiver: rx,
        },
    )
}

impl MockPlugin {
    fn next_delivery_outcome(&self) -> Result<(), EventsError> {
        let remaining = self.shared.fail_deliveries.load(Ordering::Relaxed);
        if remaining > 0 {
            self.shared
                .fail_deliveries
                .store(remaining - 1, Ordering::Relaxed);
            return Err(EventsError::Delivery("mock transport failure".into()));
        }
        Ok(())
    }

    async fn maybe_block(&self) {
        if self.shared.block_deliveries.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_config(&mut self, _section: &mut ConfigSection) {
        self.shared.init_config_calls.fetch_add(1, Ordering::Relaxed);
    }

    async fn init(&mut self, _section: &ConfigSection) -> Result<(), EventsError> {
        self.shared.init_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = self.shared.fail_init.lock().clone() {
            return Err(EventsError::PluginInit {
                plugin: self.name.clone(),
                message,
            });
        }
        Ok(())
    }

    fn set_handler(
        &mut self,
        namespace: &str,
        handler: Arc<dyn Callbacks>,
    ) -> Result<(), EventsError> {
        self.shared
            .handler_namespaces
            .lock()
            .push(namespace.to_string());
        *self.shared.handler.lock() = Some(handler);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.shared.capabilities()
    }

    async fn validate_options(
        &self,
        options: &mut SubscriptionOptions,
    ) -> Result<(), EventsError> {
        if let Some(message) = self.shared.fail_validate.lock().clone() {
            return Err(EventsError::InvalidOptions(message));
        }
        if self.shared.force_with_data.load(Ordering::Relaxed) {
            options.with_data = true;
        }
        Ok(())
    }

    async fn delivery_request(
        &self,
        conn_id: &str,
        _subscription: &SubscriptionRef,
        event: &EventDelivery,
        data: Option<&Value>,
    ) -> Result<(), EventsError> {
        self.maybe_block().await;
        self.next_delivery_outcome()?;
        let _ = self.deliveries.send(MockDelivery::Single {
            conn_id: conn_id.to_string(),
            event: event.clone(),
            data: data.cloned(),
        });
        Ok(())
    }

    async fn batch_delivery_request(
        &self,
        conn_id: &str,
        _subscription: &SubscriptionRef,
        batch: &EventBatch,
    ) -> Result<(), EventsError> {
        self.maybe_block().await;
        self.next_delivery_outcome()?;
        let _ = self.deliveries.send(MockDelivery::Batch {
            conn_id: conn_id.to_string(),
            batch: batch.clone(),
        });
        Ok(())
    }

    fn namespace_restarted(&self, namespace: &str, start_time: DateTime<Utc>) {
        self.shared
            .namespace_restarts
            .lock()
            .push((namespace.to_string(), start_time));
    }
}

// ---------------------------------------------------------------------------
// MemorySubscriptionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredSubscription {
    subscription: Subscription,
    offset: u64,
}

/// In-memory subscription store with the conditional offset update.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    entries: Mutex<HashMap<Uuid, StoredSubscription>>,
}

impl MemorySubscriptionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Subscription>, EventsError> {
        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|e| namespace.map_or(true, |ns| e.subscription.sref.namespace == ns))
            .map(|e| e.subscription.clone())
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, EventsError> {
        Ok(self
            .entries
            .lock()
            .get(&id)
            .map(|e| e.subscription.clone()))
    }

    async fn create(&self, subscription: &Subscription) -> Result<(), EventsError> {
        self.entries.lock().insert(
            subscription.sref.id,
            StoredSubscription {
                subscription: subscription.clone(),
                offset: 0,
            },
        );
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), EventsError> {
        self.entries.lock().remove(&id);
        Ok(())
    }

    async fn committed_offset(&self, id: Uuid) -> Result<u64, EventsError> {
        self.entries
            .lock()
            .get(&id)
            .map(|e| e.offset)
            .ok_or(EventsError::UnknownSubscription(id))
    }

    async fn put_offset(&self, id: Uuid, expected: u64, new: u64) -> Result<(), EventsError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(EventsError::UnknownSubscription(id))?;
        if entry.offset != expected {
            return Err(EventsError::OffsetConflict {
                subscription: id,
                expected,
                actual: entry.offset,
            });
        }
        entry.offset = new;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryEventSource
// ---------------------------------------------------------------------------

/// In-memory, strictly ordered event log.
///
/// Sequences start at 1 per namespace, so an offset of zero means
/// "nothing delivered yet". Filters are not interpreted: the test source
/// hands back every event in the namespace.
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    logs: Mutex<HashMap<String, Vec<EnrichedEvent>>>,
}

impl MemoryEventSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a confirmed event and returns its sequence.
    pub fn append(&self, namespace: &str, event_type: &str, data: Option<Value>) -> u64 {
        let mut logs = self.logs.lock();
        let log = logs.entry(namespace.to_string()).or_default();
        let sequence = log.len() as u64 + 1;
        log.push(EnrichedEvent {
            event: Event {
                id: Uuid::new_v4(),
                sequence,
                namespace: namespace.to_string(),
                event_type: event_type.to_string(),
                reference: Uuid::new_v4(),
                correlator: None,
            },
            data,
        });
        sequence
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn next_events(
        &self,
        namespace: &str,
        _filter: &SubscriptionFilter,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EnrichedEvent>, EventsError> {
        let logs = self.logs.lock();
        Ok(logs
            .get(namespace)
            .map(|log| {
                log.iter()
                    .filter(|ev| ev.event.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head_offset(&self, namespace: &str) -> Result<u64, EventsError> {
        let logs = self.logs.lock();
        Ok(logs.get(namespace).map_or(0, |log| log.len() as u64))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Polls the store until the subscription's committed offset reaches
/// `expected`.
///
/// # Panics
///
/// Panics if the offset has not reached `expected` within two seconds.
pub async fn wait_for_offset(store: &MemorySubscriptionStore, id: Uuid, expected: u64) {
    for _ in 0..200 {
        if let Ok(offset) = store.committed_offset(id).await {
            if offset == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let actual = store.committed_offset(id).await;
    panic!("offset for {id} did not reach {expected} (last read: {actual:?})");
}
