//! Engine error types.
//!
//! One hierarchy for every failure class the engine distinguishes:
//! fatal plugin initialization, synchronous option validation, transient
//! delivery failures (retried, never escalated past the connection), and
//! conditional offset-write conflicts (resolved by reloading, never
//! escalated at all).

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the subscription dispatch engine.
#[derive(Debug, Error)]
pub enum EventsError {
    /// A transport plugin failed to initialize. The plugin is excluded
    /// from dispatch for the lifetime of the process.
    #[error("plugin '{plugin}' failed to initialize: {message}")]
    PluginInit {
        /// The plugin name.
        plugin: String,
        /// Failure detail from the plugin.
        message: String,
    },

    /// An operation referenced a plugin that has not (successfully)
    /// completed initialization.
    #[error("plugin '{0}' is not initialized")]
    PluginNotInitialized(String),

    /// A subscription names a transport no registered plugin provides.
    #[error("unknown transport: '{0}'")]
    UnknownTransport(String),

    /// Subscription options were rejected by the owning transport.
    #[error("invalid subscription options: {0}")]
    InvalidOptions(String),

    /// A delivery request to a transport failed. Retried by the owning
    /// dispatcher with backoff; the committed offset is untouched.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A conditional offset write lost the race against another
    /// dispatcher for the same subscription.
    #[error(
        "offset conflict on subscription {subscription}: expected {expected}, found {actual}"
    )]
    OffsetConflict {
        /// The subscription whose offset was contended.
        subscription: Uuid,
        /// The offset the writer expected to replace.
        expected: u64,
        /// The offset actually found in the store.
        actual: u64,
    },

    /// The subscription store failed.
    #[error("subscription store error: {0}")]
    Store(String),

    /// The event source failed.
    #[error("event source error: {0}")]
    Source(String),

    /// An operation referenced a subscription the store does not hold.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(Uuid),

    /// An operation referenced a connection that is not registered.
    #[error("unknown connection: '{0}'")]
    UnknownConnection(String),

    /// A required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// A configuration value is present but invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine has been dropped; no further callbacks are accepted.
    #[error("engine stopped")]
    EngineStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_init_display() {
        let err = EventsError::PluginInit {
            plugin: "websockets".into(),
            message: "bind failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "plugin 'websockets' failed to initialize: bind failed"
        );
    }

    #[test]
    fn test_offset_conflict_display() {
        let id = Uuid::nil();
        let err = EventsError::OffsetConflict {
            subscription: id,
            expected: 3,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 7"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_unknown_transport_display() {
        let err = EventsError::UnknownTransport("amqp".into());
        assert_eq!(err.to_string(), "unknown transport: 'amqp'");
    }
}
