//! Per-(connection, subscription) delivery state machine.
//!
//! One [`Dispatcher`] runs per (connection, subscription) pair, as one
//! independently scheduled task that:
//!
//! 1. **Pulls** the next run of events from the [`EventSource`] at its
//!    cursor, bounded by the in-flight window.
//! 2. **Delivers** them through the owning plugin, singly or as one
//!    batch when the plugin and subscription both allow it.
//! 3. **Tracks** outstanding deliveries in an ordered in-flight map and
//!    advances the committed offset past the longest contiguous
//!    acknowledged run — never past an unacknowledged gap.
//! 4. **Persists** each advance through the store's conditional update,
//!    reloading its cursor if a concurrent dispatcher won the write.
//! 5. **Rewinds** to the last persisted offset on rejection, redelivering
//!    everything from the committed point forward.
//!
//! The cursor and in-flight map are owned exclusively by the task; the
//! only way in is the response channel held by [`DispatcherHandle`], and
//! the only way to stop it is the shutdown signal, which interrupts a
//! blocked delivery call without deadlock.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::EventsError;
use crate::metrics::DispatchMetrics;
use crate::plugin::{Capabilities, Plugin};
use crate::source::EventSource;
use crate::store::SubscriptionStore;
use crate::subscription::{
    CombinedEventData, DeliveryReference, EnrichedEvent, EventBatch, EventDelivery,
    EventDeliveryResponse, Subscription, SubscriptionRef,
};

// ---------------------------------------------------------------------------
// DispatchState
// ---------------------------------------------------------------------------

/// Lifecycle state of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No events outstanding; waiting for the source to produce more.
    Idle,
    /// Pushing events through the plugin.
    Delivering,
    /// Deliveries outstanding; waiting for consumer responses.
    AwaitingAck,
    /// Terminal: the connection closed or the subscription was deleted.
    /// Outstanding in-flight state is discarded without persisting.
    Closed,
}

// ---------------------------------------------------------------------------
// DispatchContext
// ---------------------------------------------------------------------------

/// Shared collaborators a dispatcher needs, cloned per spawn.
#[derive(Clone)]
pub struct DispatchContext {
    /// The plugin that owns the connection.
    pub plugin: Arc<dyn Plugin>,

    /// The plugin's capabilities, cached at init.
    pub capabilities: Capabilities,

    /// Durable subscription store.
    pub store: Arc<dyn SubscriptionStore>,

    /// Confirmed event log.
    pub source: Arc<dyn EventSource>,

    /// Dispatch tunables.
    pub config: DispatchConfig,

    /// Shared counters.
    pub metrics: Arc<DispatchMetrics>,
}

// ---------------------------------------------------------------------------
// DispatcherHandle
// ---------------------------------------------------------------------------

/// Handle to a running dispatcher task.
///
/// Dropping the handle (or calling [`stop`](Self::stop)) shuts the task
/// down; in-flight deliveries are discarded without persisting an offset
/// change, preserving at-least-once semantics.
#[derive(Debug)]
pub struct DispatcherHandle {
    subscription: SubscriptionRef,
    ephemeral: bool,
    responses: mpsc::Sender<EventDeliveryResponse>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl DispatcherHandle {
    /// Returns the subscription this dispatcher serves.
    #[must_use]
    pub fn subscription(&self) -> &SubscriptionRef {
        &self.subscription
    }

    /// Returns `true` if the subscription is ephemeral.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Forwards a delivery response to the dispatcher task.
    ///
    /// Returns `false` if the response could not be enqueued (the task
    /// has stopped or its channel is full); the response is dropped.
    pub fn deliver_response(&self, response: EventDeliveryResponse) -> bool {
        self.responses.try_send(response).is_ok()
    }

    /// Signals the dispatcher to stop. Returns immediately; the task
    /// winds down on its own, interrupting any blocked delivery call.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Returns `true` once the dispatcher task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the dispatcher task to exit.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Signals that shutdown was requested while the dispatcher was blocked.
struct Stopped;

/// One outstanding delivery unit: a single event or a whole batch
/// covering a run of matching sequences.
#[derive(Debug)]
struct InFlightEntry {
    /// Last sequence covered by this unit (equals the key for singles).
    last: u64,
    /// Events in the unit. The sequence span can be wider when the
    /// subscription filter skips log entries.
    count: u64,
    /// Batch ID when the unit is a batch delivery.
    batch: Option<Uuid>,
    /// Whether the consumer has acknowledged the unit.
    acked: bool,
}

/// The delivery and acknowledgment state machine for one
/// (connection, subscription) pair.
pub struct Dispatcher {
    conn_id: String,
    sub: Subscription,
    plugin: Arc<dyn Plugin>,
    capabilities: Capabilities,
    store: Arc<dyn SubscriptionStore>,
    source: Arc<dyn EventSource>,
    config: DispatchConfig,
    metrics: Arc<DispatchMetrics>,
    responses: mpsc::Receiver<EventDeliveryResponse>,
    shutdown: watch::Receiver<bool>,
    state: DispatchState,
    /// Highest sequence confirmed and (for durable subscriptions) due to
    /// be persisted.
    committed: u64,
    /// Last offset known to be durably persisted. Trails `committed`
    /// only while a store write is outstanding or has failed.
    persisted: u64,
    /// Highest sequence delivered so far; pulls resume after it.
    cursor: u64,
    /// Outstanding delivery units, keyed by first sequence.
    in_flight: BTreeMap<u64, InFlightEntry>,
}

impl Dispatcher {
    /// Spawns a dispatcher task for `sub` on connection `conn_id`.
    #[must_use]
    pub fn spawn(
        conn_id: impl Into<String>,
        sub: Subscription,
        ctx: DispatchContext,
    ) -> DispatcherHandle {
        let conn_id = conn_id.into();
        let window = sub
            .options
            .read_ahead
            .unwrap_or(ctx.config.max_read_ahead)
            .max(1);
        let (response_tx, response_rx) = mpsc::channel(window * 2 + 4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let subscription = sub.sref.clone();
        let ephemeral = sub.ephemeral;
        let dispatcher = Dispatcher {
            conn_id,
            sub,
            plugin: ctx.plugin,
            capabilities: ctx.capabilities,
            store: ctx.store,
            source: ctx.source,
            config: ctx.config,
            metrics: ctx.metrics,
            responses: response_rx,
            shutdown: shutdown_rx,
            state: DispatchState::Idle,
            committed: 0,
            persisted: 0,
            cursor: 0,
            in_flight: BTreeMap::new(),
        };
        let task = tokio::spawn(dispatcher.run());

        DispatcherHandle {
            subscription,
            ephemeral,
            responses: response_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self) {
        if self.init_cursor().await.is_err() {
            tracing::debug!(
                conn_id = %self.conn_id,
                subscription = %self.sub.sref,
                "dispatcher closed before starting"
            );
            return;
        }
        tracing::debug!(
            conn_id = %self.conn_id,
            subscription = %self.sub.sref,
            offset = self.cursor,
            "dispatcher started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if self.fill_window().await.is_err() {
                break;
            }

            self.state = if self.in_flight.is_empty() {
                DispatchState::Idle
            } else {
                DispatchState::AwaitingAck
            };
            tracing::trace!(
                conn_id = %self.conn_id,
                subscription = %self.sub.sref,
                state = ?self.state,
                in_flight = self.in_flight_events(),
                committed = self.committed,
                "dispatch cycle"
            );

            let window_full = self.in_flight_events() >= self.window();
            let poll = self.config.poll_interval;
            enum SelectOutcome {
                Response(Option<EventDeliveryResponse>),
                Tick,
            }
            let outcome = tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                response = self.responses.recv() => SelectOutcome::Response(response),
                () = tokio::time::sleep(poll), if !window_full => SelectOutcome::Tick,
            };
            match outcome {
                SelectOutcome::Response(Some(response)) => self.handle_response(response).await,
                SelectOutcome::Response(None) => break,
                SelectOutcome::Tick => {}
            }
        }

        self.state = DispatchState::Closed;
        tracing::debug!(
            conn_id = %self.conn_id,
            subscription = %self.sub.sref,
            discarded = self.in_flight_events(),
            committed = self.persisted,
            "dispatcher stopped"
        );
    }

    /// Loads the starting offset: the persisted committed offset for
    /// durable subscriptions, the namespace head for ephemeral ones.
    /// Retries with backoff until it succeeds or shutdown is signalled.
    async fn init_cursor(&mut self) -> Result<(), Stopped> {
        let mut delay = self.config.retry_initial_delay;
        loop {
            let loaded = if self.sub.ephemeral {
                self.source.head_offset(&self.sub.sref.namespace).await
            } else {
                self.store.committed_offset(self.sub.sref.id).await
            };
            match loaded {
                Ok(offset) => {
                    self.committed = offset;
                    self.persisted = offset;
                    self.cursor = offset;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        subscription = %self.sub.sref,
                        error = %e,
                        "failed to load starting offset, retrying"
                    );
                    self.backoff(&mut delay).await?;
                }
            }
        }
    }

    /// The effective in-flight window for this subscription.
    fn window(&self) -> usize {
        self.sub
            .options
            .read_ahead
            .unwrap_or(self.config.max_read_ahead)
            .max(1)
    }

    /// Events covered by outstanding delivery units.
    fn in_flight_events(&self) -> usize {
        self.in_flight
            .values()
            .map(|entry| entry.count as usize)
            .sum()
    }

    /// Pulls and delivers events until the window is full or the source
    /// has nothing more.
    async fn fill_window(&mut self) -> Result<(), Stopped> {
        let batching = self.capabilities.batch_delivery && self.sub.options.batch;
        let batch_limit = self
            .sub
            .options
            .batch_size
            .unwrap_or(self.config.max_batch_size)
            .max(1);

        loop {
            let outstanding = self.in_flight_events();
            let window = self.window();
            if outstanding >= window {
                return Ok(());
            }
            let capacity = window - outstanding;
            let limit = if batching {
                capacity.min(batch_limit)
            } else {
                capacity
            };

            let mut events = match self
                .source
                .next_events(&self.sub.sref.namespace, &self.sub.filter, self.cursor, limit)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(
                        subscription = %self.sub.sref,
                        error = %e,
                        "event source read failed"
                    );
                    return Ok(());
                }
            };
            if events.is_empty() {
                return Ok(());
            }

            // Hold a partial batch open briefly in case more events land.
            if batching && events.len() < limit && !self.config.batch_timeout.is_zero() {
                self.hold_for_batch().await?;
                if let Some(last) = events.last().map(|ev| ev.event.sequence) {
                    if let Ok(more) = self
                        .source
                        .next_events(
                            &self.sub.sref.namespace,
                            &self.sub.filter,
                            last,
                            limit - events.len(),
                        )
                        .await
                    {
                        events.extend(more);
                    }
                }
            }

            self.state = DispatchState::Delivering;
            if batching && events.len() > 1 {
                self.deliver_batch(events).await?;
            } else {
                for event in events {
                    self.deliver_single(event).await?;
                }
            }
            self.state = DispatchState::AwaitingAck;
        }
    }

    async fn hold_for_batch(&mut self) -> Result<(), Stopped> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(self.config.batch_timeout) => Ok(()),
            _ = shutdown.wait_for(|stop| *stop) => Err(Stopped),
        }
    }

    /// Delivers one event, retrying with backoff until the plugin
    /// accepts it or shutdown interrupts.
    async fn deliver_single(&mut self, event: EnrichedEvent) -> Result<(), Stopped> {
        let sequence = event.event.sequence;
        let delivery = EventDelivery {
            event: event.event,
            subscription: self.sub.sref.clone(),
        };
        let data = if self.sub.options.with_data {
            event.data
        } else {
            None
        };

        let mut delay = self.config.retry_initial_delay;
        let mut shutdown = self.shutdown.clone();
        loop {
            let result = tokio::select! {
                result = self.plugin.delivery_request(
                    &self.conn_id,
                    &self.sub.sref,
                    &delivery,
                    data.as_ref(),
                ) => result,
                _ = shutdown.wait_for(|stop| *stop) => return Err(Stopped),
            };
            match result {
                Ok(()) => break,
                Err(e) => {
                    tracing::debug!(
                        conn_id = %self.conn_id,
                        subscription = %self.sub.sref,
                        sequence,
                        error = %e,
                        "delivery request failed, retrying"
                    );
                    DispatchMetrics::incr(&self.metrics.delivery_retries);
                    self.backoff(&mut delay).await?;
                }
            }
        }

        self.in_flight.insert(
            sequence,
            InFlightEntry {
                last: sequence,
                count: 1,
                batch: None,
                acked: false,
            },
        );
        self.cursor = sequence;
        DispatchMetrics::incr(&self.metrics.events_delivered);
        Ok(())
    }

    /// Delivers a run of events as one batch, retrying with backoff. The
    /// batch keeps its ID across retries.
    async fn deliver_batch(&mut self, events: Vec<EnrichedEvent>) -> Result<(), Stopped> {
        let Some(first) = events.first().map(|ev| ev.event.sequence) else {
            return Ok(());
        };
        let Some(last) = events.last().map(|ev| ev.event.sequence) else {
            return Ok(());
        };
        let count = events.len() as u64;

        let batch = EventBatch {
            id: Uuid::new_v4(),
            events: events
                .into_iter()
                .map(|ev| CombinedEventData {
                    event: EventDelivery {
                        event: ev.event,
                        subscription: self.sub.sref.clone(),
                    },
                    data: if self.sub.options.with_data {
                        ev.data
                    } else {
                        None
                    },
                })
                .collect(),
        };

        let mut delay = self.config.retry_initial_delay;
        let mut shutdown = self.shutdown.clone();
        loop {
            let result = tokio::select! {
                result = self.plugin.batch_delivery_request(
                    &self.conn_id,
                    &self.sub.sref,
                    &batch,
                ) => result,
                _ = shutdown.wait_for(|stop| *stop) => return Err(Stopped),
            };
            match result {
                Ok(()) => break,
                Err(e) => {
                    tracing::debug!(
                        conn_id = %self.conn_id,
                        subscription = %self.sub.sref,
                        batch = %batch.id,
                        error = %e,
                        "batch delivery request failed, retrying"
                    );
                    DispatchMetrics::incr(&self.metrics.delivery_retries);
                    self.backoff(&mut delay).await?;
                }
            }
        }

        self.in_flight.insert(
            first,
            InFlightEntry {
                last,
                count,
                batch: Some(batch.id),
                acked: false,
            },
        );
        self.cursor = last;
        DispatchMetrics::add(&self.metrics.events_delivered, count);
        DispatchMetrics::incr(&self.metrics.batches_delivered);
        Ok(())
    }

    async fn backoff(&self, delay: &mut std::time::Duration) -> Result<(), Stopped> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(*delay) => {
                *delay = (*delay * 2).min(self.config.retry_max_delay);
                Ok(())
            }
            _ = shutdown.wait_for(|stop| *stop) => Err(Stopped),
        }
    }

    /// Applies a consumer's ack/reject verdict.
    async fn handle_response(&mut self, response: EventDeliveryResponse) {
        if response.subscription.id != self.sub.sref.id {
            self.drop_response(&response);
            return;
        }

        match response.reference {
            DeliveryReference::Event { sequence, .. } => {
                let known = matches!(
                    self.in_flight.get(&sequence),
                    Some(entry) if entry.batch.is_none() && !entry.acked
                );
                if !known {
                    // Unknown, duplicate, or a partial batch ack: dropped.
                    self.drop_response(&response);
                    return;
                }
                if response.rejected {
                    self.rewind("event rejected").await;
                    return;
                }
                if let Some(entry) = self.in_flight.get_mut(&sequence) {
                    entry.acked = true;
                }
                DispatchMetrics::incr(&self.metrics.events_acknowledged);
                self.advance().await;
            }
            DeliveryReference::Batch { id } => {
                let found = self
                    .in_flight
                    .iter()
                    .find(|(_, entry)| entry.batch == Some(id) && !entry.acked)
                    .map(|(first, entry)| (*first, entry.count));
                let Some((first, count)) = found else {
                    self.drop_response(&response);
                    return;
                };
                if response.rejected {
                    self.rewind("batch rejected").await;
                    return;
                }
                // A batch acknowledges atomically, as one unit.
                if let Some(entry) = self.in_flight.get_mut(&first) {
                    entry.acked = true;
                }
                DispatchMetrics::add(&self.metrics.events_acknowledged, count);
                self.advance().await;
            }
        }
    }

    fn drop_response(&self, response: &EventDeliveryResponse) {
        DispatchMetrics::incr(&self.metrics.responses_dropped);
        tracing::debug!(
            conn_id = %self.conn_id,
            subscription = %self.sub.sref,
            reference = ?response.reference,
            "dropped delivery response with no matching in-flight delivery"
        );
    }

    /// Advances the committed offset past the longest run of
    /// acknowledged units at the front of the in-flight map. An unacked
    /// unit holds the offset: later acknowledgments are recorded but
    /// never committed past the gap.
    async fn advance(&mut self) {
        let mut advanced = false;
        loop {
            let front = self
                .in_flight
                .first_key_value()
                .map(|(first, entry)| (*first, entry.last, entry.acked));
            let Some((first, last, acked)) = front else {
                break;
            };
            if !acked {
                break;
            }
            self.in_flight.remove(&first);
            self.committed = last;
            advanced = true;
        }
        if advanced {
            self.persist_offset().await;
        }
    }

    /// Persists the committed offset through the store's conditional
    /// update. A conflict means another dispatcher for this subscription
    /// advanced the offset first: discard local progress and reload.
    async fn persist_offset(&mut self) {
        if self.sub.ephemeral {
            self.persisted = self.committed;
            return;
        }
        match self
            .store
            .put_offset(self.sub.sref.id, self.persisted, self.committed)
            .await
        {
            Ok(()) => {
                self.persisted = self.committed;
                DispatchMetrics::incr(&self.metrics.offset_commits);
            }
            Err(EventsError::OffsetConflict { actual, .. }) => {
                tracing::warn!(
                    subscription = %self.sub.sref,
                    expected = self.persisted,
                    actual,
                    "offset write conflict, reloading cursor"
                );
                DispatchMetrics::incr(&self.metrics.offset_conflicts);
                DispatchMetrics::add(
                    &self.metrics.events_redelivered,
                    self.in_flight_events() as u64,
                );
                self.in_flight.clear();
                self.committed = actual;
                self.persisted = actual;
                self.cursor = actual;
            }
            Err(e) => {
                // Keep local progress; the next advance retries the write
                // from the last offset known to be persisted.
                tracing::warn!(
                    subscription = %self.sub.sref,
                    error = %e,
                    "offset write failed, will retry on next advance"
                );
            }
        }
    }

    /// Rejection: discard all in-flight units and resume from the last
    /// persisted offset. Everything after it is redelivered, including
    /// events an earlier ack round ran ahead of but never committed.
    async fn rewind(&mut self, reason: &str) {
        DispatchMetrics::add(
            &self.metrics.events_redelivered,
            self.in_flight_events() as u64,
        );
        self.in_flight.clear();

        if !self.sub.ephemeral {
            match self.store.committed_offset(self.sub.sref.id).await {
                Ok(offset) => self.persisted = offset,
                Err(e) => {
                    tracing::warn!(
                        subscription = %self.sub.sref,
                        error = %e,
                        "could not re-read committed offset, rewinding to last known"
                    );
                }
            }
        }
        self.committed = self.persisted;
        self.cursor = self.persisted;
        self.state = DispatchState::Delivering;
        tracing::debug!(
            conn_id = %self.conn_id,
            subscription = %self.sub.sref,
            offset = self.persisted,
            reason,
            "rewound to last committed offset"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================
