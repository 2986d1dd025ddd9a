//! Message bus abstraction for cross-service event delivery.
//!
//! The bus carries [`EventEnvelope`]s between the service that owns auction
//! records and its downstream consumers. Delivery is at-least-once: an
//! envelope may arrive more than once and consumers must deduplicate by
//! `message_id`. Ordering is only guaranteed per aggregate (implementations
//! key messages by `aggregate_id`), never globally.
//!
//! The owning service must keep accepting writes while the broker is down;
//! that is the outbox's job, so bus errors here are transient by contract and
//! surface to callers that retry (the dispatcher on its next tick, consumers
//! through their reconnect policy).

use crate::event::EventEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to reach the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A publish was not acknowledged.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// A received message was not a well-formed envelope.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error mid-stream.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of envelopes from a subscription.
///
/// Each item is a `Result` so transport hiccups surface in-band without
/// tearing down the subscription loop.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, BusError>> + Send>>;

/// Publish/subscribe transport over an asynchronous broker connection.
///
/// # Delivery Contract
///
/// - **At-least-once**: publish resolves only after broker acknowledgement;
///   subscriber offsets commit only after handoff. Duplicates are possible
///   on either side and are the consumer's problem by design.
/// - **Per-aggregate ordering**: envelopes for one auction arrive in publish
///   order; envelopes for different auctions may interleave arbitrarily.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the bus can be shared as
/// `Arc<dyn MessageBus>` between the dispatcher, consumers and tests.
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a topic, resolving on broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker did not acknowledge;
    /// the caller must treat the message as unsent.
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of envelopes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription could
    /// not be established; callers retry per their connect policy.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>>;
}
