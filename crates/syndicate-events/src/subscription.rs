//! Subscription and delivery data model.
//!
//! The durable [`Subscription`] record, the transient delivery types
//! exchanged with transport plugins ([`EventDelivery`], [`EventBatch`],
//! [`EventDeliveryResponse`]), and the identities that tie them together.
//! All entities are scoped to one namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SubscriptionRef
// ---------------------------------------------------------------------------

/// Cheap, clonable identity of a subscription.
///
/// This is what connection matchers see and what every delivery carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionRef {
    /// Unique subscription ID.
    pub id: Uuid,

    /// Namespace the subscription lives in.
    pub namespace: String,

    /// Consumer-chosen subscription name.
    pub name: String,
}

impl std::fmt::Display for SubscriptionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.id)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionFilter
// ---------------------------------------------------------------------------

/// Opaque predicate document restricting which events a subscription
/// receives.
///
/// The engine does not interpret the document; the event source applies
/// it when reading the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionFilter {
    /// The predicate document.
    pub document: Value,
}

impl SubscriptionFilter {
    /// Creates a filter from a predicate document.
    #[must_use]
    pub fn new(document: Value) -> Self {
        Self { document }
    }

    /// Returns `true` if the filter has no predicate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.is_null()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionOptions
// ---------------------------------------------------------------------------

/// Delivery options for a subscription.
///
/// Transports may normalize these during option validation (for example
/// forcing data delivery on).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    /// Whether event data payloads are attached to deliveries.
    pub with_data: bool,

    /// Whether the subscription accepts batch delivery.
    pub batch: bool,

    /// Per-subscription override of the in-flight window size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ahead: Option<usize>,

    /// Per-subscription override of the maximum batch size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A durable subscription record.
///
/// The committed offset lives in the subscription store, not on this
/// struct: it is mutated only by the subscription's dispatcher, through
/// the store's conditional update, and persisted before it is considered
/// final. Ephemeral subscriptions never reach the store; their offset
/// exists only in their dispatcher's memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Identity (ID, namespace, name).
    #[serde(flatten)]
    pub sref: SubscriptionRef,

    /// Name of the transport plugin that owns delivery.
    pub transport: String,

    /// Predicate restricting which events are delivered.
    pub filter: SubscriptionFilter,

    /// Delivery options.
    pub options: SubscriptionOptions,

    /// Whether the subscription is connection-scoped and non-durable.
    pub ephemeral: bool,

    /// Creation time.
    pub created: DateTime<Utc>,
}

impl Subscription {
    /// Creates a durable subscription.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        transport: impl Into<String>,
        filter: SubscriptionFilter,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            sref: SubscriptionRef {
                id: Uuid::new_v4(),
                namespace: namespace.into(),
                name: name.into(),
            },
            transport: transport.into(),
            filter,
            options,
            ephemeral: false,
            created: Utc::now(),
        }
    }

    /// Creates an ephemeral subscription bound to one connection.
    ///
    /// The name is derived from the generated ID since ephemeral
    /// subscriptions are never addressed by name.
    #[must_use]
    pub fn ephemeral(
        namespace: impl Into<String>,
        transport: impl Into<String>,
        filter: SubscriptionFilter,
        options: SubscriptionOptions,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            sref: SubscriptionRef {
                id,
                namespace: namespace.into(),
                name: format!("ephemeral-{id}"),
            },
            transport: transport.into(),
            filter,
            options,
            ephemeral: true,
            created: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A confirmed event from the namespace log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: Uuid,

    /// Position in the namespace log. Strictly increasing per namespace.
    pub sequence: u64,

    /// Namespace the event belongs to.
    pub namespace: String,

    /// Event type tag (e.g. `message_confirmed`).
    pub event_type: String,

    /// ID of the object the event refers to (a message, a transaction).
    /// Opaque to the engine.
    pub reference: Uuid,

    /// Correlation ID consumers use to tie the event back to a request
    /// they initiated, when the producing subsystem set one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlator: Option<Uuid>,
}

/// An event paired with its data payload, as read from the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedEvent {
    /// The event.
    pub event: Event,

    /// Data payload, when the log holds one for this event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One unit of delivery offered to a transport plugin.
///
/// Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDelivery {
    /// The event being delivered.
    pub event: Event,

    /// The subscription the delivery belongs to.
    pub subscription: SubscriptionRef,
}

/// An event delivery paired with its data, as carried inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedEventData {
    /// The delivery.
    pub event: EventDelivery,

    /// Data payload, only populated when the subscription requests data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A group of events delivered and acknowledged as one atomic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    /// Batch ID the acknowledgment must reference.
    pub id: Uuid,

    /// The batched deliveries, in sequence order.
    pub events: Vec<CombinedEventData>,
}

// ---------------------------------------------------------------------------
// Delivery responses
// ---------------------------------------------------------------------------

/// What a delivery response refers to: a single event or a whole batch.
///
/// Partial acknowledgment of a batch is not expressible; a batch is
/// referenced only by its ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeliveryReference {
    /// A single event delivery.
    Event {
        /// The delivered event's ID.
        id: Uuid,
        /// The delivered event's sequence.
        sequence: u64,
    },

    /// A batch delivery.
    Batch {
        /// The batch ID.
        id: Uuid,
    },
}

/// A consumer's verdict on a prior delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDeliveryResponse {
    /// The subscription the response applies to.
    pub subscription: SubscriptionRef,

    /// The delivery being responded to.
    pub reference: DeliveryReference,

    /// `true` rewinds the subscription to its last committed offset and
    /// redelivers from there; `false` acknowledges.
    pub rejected: bool,

    /// Optional human-readable detail (e.g. a rejection reason).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,

    /// Optional reply payload the consumer sends back with the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Value>,
}

impl EventDeliveryResponse {
    /// Builds an acknowledgment for a single event delivery.
    #[must_use]
    pub fn ack(delivery: &EventDelivery) -> Self {
        Self {
            subscription: delivery.subscription.clone(),
            reference: DeliveryReference::Event {
                id: delivery.event.id,
                sequence: delivery.event.sequence,
            },
            rejected: false,
            info: None,
            reply: None,
        }
    }

    /// Builds a rejection for a single event delivery.
    #[must_use]
    pub fn reject(delivery: &EventDelivery, info: impl Into<String>) -> Self {
        Self {
            rejected: true,
            info: Some(info.into()),
            ..Self::ack(delivery)
        }
    }

    /// Builds an acknowledgment for a batch delivery.
    #[must_use]
    pub fn ack_batch(subscription: SubscriptionRef, batch_id: Uuid) -> Self {
        Self {
            subscription,
            reference: DeliveryReference::Batch { id: batch_id },
            rejected: false,
            info: None,
            reply: None,
        }
    }

    /// Builds a rejection for a batch delivery.
    #[must_use]
    pub fn reject_batch(
        subscription: SubscriptionRef,
        batch_id: Uuid,
        info: impl Into<String>,
    ) -> Self {
        Self {
            rejected: true,
            info: Some(info.into()),
            ..Self::ack_batch(subscription, batch_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_delivery() -> EventDelivery {
        EventDelivery {
            event: Event {
                id: Uuid::new_v4(),
                sequence: 7,
                namespace: "ns1".into(),
                event_type: "message_confirmed".into(),
                reference: Uuid::new_v4(),
                correlator: None,
            },
            subscription: SubscriptionRef {
                id: Uuid::new_v4(),
                namespace: "ns1".into(),
                name: "app1".into(),
            },
        }
    }

    // --- Identity tests ---

    #[test]
    fn test_subscription_ref_display() {
        let sref = SubscriptionRef {
            id: Uuid::nil(),
            namespace: "ns1".into(),
            name: "app1".into(),
        };
        assert_eq!(
            sref.to_string(),
            "ns1/app1 (00000000-0000-0000-0000-000000000000)"
        );
    }

    #[test]
    fn test_subscription_new() {
        let sub = Subscription::new(
            "ns1",
            "app1",
            "websockets",
            SubscriptionFilter::default(),
            SubscriptionOptions::default(),
        );
        assert_eq!(sub.sref.namespace, "ns1");
        assert_eq!(sub.sref.name, "app1");
        assert_eq!(sub.transport, "websockets");
        assert!(!sub.ephemeral);
        assert!(sub.filter.is_empty());
    }

    #[test]
    fn test_subscription_ephemeral() {
        let sub = Subscription::ephemeral(
            "ns1",
            "websockets",
            SubscriptionFilter::default(),
            SubscriptionOptions::default(),
        );
        assert!(sub.ephemeral);
        assert!(sub.sref.name.starts_with("ephemeral-"));
        assert!(sub.sref.name.contains(&sub.sref.id.to_string()));
    }

    // --- Filter tests ---

    #[test]
    fn test_filter_document() {
        let filter = SubscriptionFilter::new(json!({"events": "message_confirmed"}));
        assert!(!filter.is_empty());
        assert_eq!(filter.document["events"], "message_confirmed");
    }

    // --- Options serde tests ---

    #[test]
    fn test_options_serde() {
        let options = SubscriptionOptions {
            with_data: true,
            batch: true,
            read_ahead: Some(50),
            batch_size: None,
        };
        let s = serde_json::to_string(&options).unwrap();
        assert!(s.contains("\"withData\":true"));
        assert!(s.contains("\"readAhead\":50"));
        assert!(!s.contains("batchSize"));

        let back: SubscriptionOptions = serde_json::from_str(&s).unwrap();
        assert_eq!(back, options);
    }

    // --- Response builder tests ---

    #[test]
    fn test_response_ack() {
        let delivery = sample_delivery();
        let resp = EventDeliveryResponse::ack(&delivery);
        assert!(!resp.rejected);
        assert_eq!(resp.subscription, delivery.subscription);
        assert_eq!(
            resp.reference,
            DeliveryReference::Event {
                id: delivery.event.id,
                sequence: 7
            }
        );
    }

    #[test]
    fn test_response_reject() {
        let delivery = sample_delivery();
        let resp = EventDeliveryResponse::reject(&delivery, "consumer busy");
        assert!(resp.rejected);
        assert_eq!(resp.info.as_deref(), Some("consumer busy"));
    }

    #[test]
    fn test_response_batch_builders() {
        let sref = sample_delivery().subscription;
        let batch_id = Uuid::new_v4();

        let ack = EventDeliveryResponse::ack_batch(sref.clone(), batch_id);
        assert!(!ack.rejected);
        assert_eq!(ack.reference, DeliveryReference::Batch { id: batch_id });

        let rej = EventDeliveryResponse::reject_batch(sref, batch_id, "nope");
        assert!(rej.rejected);
        assert_eq!(rej.reference, DeliveryReference::Batch { id: batch_id });
    }
}
