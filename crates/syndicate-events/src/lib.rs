//! # Syndicate Events
//!
//! Subscription dispatch and acknowledgment engine for the Syndicate
//! multi-party event mesh. Takes a durable log of namespaced events,
//! matches it against live consumer subscriptions, streams matching events
//! to transport plugins over active connections, and tracks delivery
//! progress with at-least-once, ordered-commit semantics.
//!
//! ## Architecture
//!
//! ```text
//! Event log (external)        Engine                      Transports (plugins)
//! ┌──────────────┐     ┌─────────────────────┐            ┌──────────────┐
//! │ EventSource  │──►  │ Dispatcher (task per│──deliver──►│ WebSockets   │
//! │  (ordered,   │     │  conn × sub):       │            │ Webhooks     │
//! │  resumable)  │     │  window, gap-hold,  │◄──ack/rej──│ Broker bridge│
//! └──────────────┘     │  rewind, backoff    │            └──────────────┘
//!                      └──────────┬──────────┘
//! ┌──────────────┐                │ conditional offset update
//! │ Subscription │◄───────────────┘
//! │ Store        │
//! └──────────────┘
//! ```
//!
//! Two independent polymorphic contracts wire the halves together: each
//! transport implements [`plugin::Plugin`], and the engine hands every
//! plugin an implementation of [`plugin::Callbacks`] through which
//! connections register, acknowledge, and close.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::manual_let_else,
        clippy::cast_possible_truncation,
        clippy::too_many_lines,
        unused_mut
    )
)]

/// Engine error types.
pub mod error;

/// Configuration sections and dispatch tunables.
pub mod config;

/// Subscription and delivery data model.
pub mod subscription;

/// Transport plugin and engine callback contracts.
pub mod plugin;

/// Durable subscription store contract.
pub mod store;

/// Ordered, resumable event source contract.
pub mod source;

/// Per-(connection, subscription) delivery state machine.
pub mod dispatcher;

/// Live connection registry.
pub mod registry;

/// Engine orchestration and plugin lifecycle.
pub mod engine;

/// Atomic dispatch counters.
pub mod metrics;

/// Testing utilities (mock plugin, in-memory store and source).
pub mod testing;

pub use config::{ConfigKeySpec, ConfigSection, DispatchConfig};
pub use dispatcher::{DispatchContext, DispatchState, Dispatcher, DispatcherHandle};
pub use engine::EventEngine;
pub use error::EventsError;
pub use metrics::DispatchMetrics;
pub use plugin::{Callbacks, Capabilities, Plugin, SubscriptionMatcher};
pub use registry::ConnectionRegistry;
pub use source::EventSource;
pub use store::SubscriptionStore;
pub use subscription::{
    CombinedEventData, DeliveryReference, EnrichedEvent, Event, EventBatch, EventDelivery,
    EventDeliveryResponse, Subscription, SubscriptionFilter, SubscriptionOptions, SubscriptionRef,
};
