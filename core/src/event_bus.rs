//! Event bus abstraction for the backend's event stream.
//!
//! The backend publishes every event it raises on a single shared topic. The
//! proxy only ever consumes from it, but [`EventBus::publish`] is part of the
//! trait so in-memory buses and tooling can feed the same stream the consumer
//! reads.
//!
//! # Delivery
//!
//! - Subscriptions start at the newest offset: nothing published before the
//!   subscription is active is ever seen
//! - The stream is lazy and unbounded; it only ends when the underlying
//!   transport is shut down
//! - A message that fails to decode, or a transport hiccup, is yielded as an
//!   `Err` item and the stream keeps going
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (testing crate) - broadcast channel, same decode path
//! - `RedpandaEventBus` (redpanda crate) - Kafka-compatible brokers via rdkafka
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let mut stream = event_bus.subscribe("voltha.events").await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(event) => println!("{:?} {:?}", event.kind, event.token),
//!         Err(e) => tracing::warn!(error = %e, "bad message"),
//!     }
//! }
//! ```

use crate::event::DeviceEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// A single message could not be decoded into a [`DeviceEvent`]
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl EventBusError {
    /// Whether the error concerns a single message rather than the transport.
    #[must_use]
    pub const fn is_message_error(&self) -> bool {
        matches!(self, Self::DeserializationFailed(_))
    }
}

/// Stream of decoded events from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<DeviceEvent, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so the
/// bus can be shared as `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish a raw, already-encoded message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to a topic and receive a stream of decoded events.
    ///
    /// The returned future resolves once the subscription is active: every
    /// message published after that point will appear on the stream.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

/// Decode a raw bus message, mapping failures into the bus error space.
///
/// # Errors
///
/// Returns [`EventBusError::DeserializationFailed`] when the payload is not a
/// valid event envelope.
pub fn decode_message(payload: &[u8]) -> Result<DeviceEvent, EventBusError> {
    DeviceEvent::decode(payload).map_err(|e| EventBusError::DeserializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_failures_are_message_errors() {
        assert!(EventBusError::DeserializationFailed("x".into()).is_message_error());
        assert!(!EventBusError::TransportError("x".into()).is_message_error());
        assert!(!EventBusError::ConnectionFailed("x".into()).is_message_error());
    }

    #[test]
    fn decode_message_maps_errors() {
        let err = decode_message(&[0x0a, 0x64, 0x01]);
        assert!(matches!(err, Err(EventBusError::DeserializationFailed(_))));
    }
}
