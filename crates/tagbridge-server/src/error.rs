//! Gateway error taxonomy.
//!
//! Every variant is converted to a client-visible error envelope at the
//! connection boundary, except `TransportWrite` (logged only) and
//! `Configuration` (fatal at startup).

use tagbridge_core::{TopicError, ValidationError};
use tagbridge_queue::QueueError;
use thiserror::Error;

/// Errors raised by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The broker or listener could not be set up.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `subscribe` on the broker failed.
    #[error("failed to subscribe to topic '{topic}': {source}")]
    Subscription {
        /// Event topic.
        topic: String,
        /// Broker failure.
        #[source]
        source: QueueError,
    },

    /// `unsubscribe` on the broker failed. Local bookkeeping was dropped anyway.
    #[error("failed to unsubscribe from topic '{topic}': {source}")]
    Unsubscription {
        /// Event topic.
        topic: String,
        /// Broker failure.
        #[source]
        source: QueueError,
    },

    /// A client frame failed the action-message check.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A message arrived for a device tag without an active subscription.
    #[error(
        "cannot send message for device tag '{device_tag}': gateway is not subscribed to its event topic"
    )]
    State {
        /// Tag the message was addressed from.
        device_tag: String,
    },

    /// A broker topic did not follow the naming convention.
    #[error(transparent)]
    TopicParse(#[from] TopicError),

    /// `publish` on the broker failed.
    #[error("failed to publish to topic '{topic}': {source}")]
    Publish {
        /// Publish topic.
        topic: String,
        /// Broker failure.
        #[source]
        source: QueueError,
    },

    /// One socket could not take a write during fan-out.
    #[error("write to connection {connection_id} failed (queue full or closed)")]
    TransportWrite {
        /// The stale connection.
        connection_id: String,
    },
}
