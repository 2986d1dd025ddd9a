//! Redpanda message bus implementation for Marketsync.
//!
//! This crate provides the production [`MessageBus`] used between the auction
//! service and its downstream consumers. It uses rdkafka, so any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, managed
//! equivalents).
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - `publish` resolves only after the broker acknowledged the record; the
//!   outbox dispatcher relies on that to decide what to mark sent
//! - consumer offsets are committed AFTER the envelope was handed to the
//!   subscriber; a crash before commit means redelivery
//! - duplicates on either side are absorbed downstream by the inbox guard
//! - messages are keyed by `aggregate_id`, so events for one auction stay
//!   ordered within their partition; there is no ordering across auctions
//!
//! # Availability
//!
//! The bus being down must never fail the auction service's write path. The
//! producer here reports publish failures to its caller and nothing more;
//! buffering unsent events is the outbox's job, and reconnect policy (bounded
//! attempts vs. retry forever) belongs to the background tasks driving this
//! client, configured per deployment.
//!
//! # Example
//!
//! ```no_run
//! use marketsync_redpanda::RedpandaBus;
//! use marketsync_core::bus::MessageBus;
//! use futures::StreamExt;
//!
//! # async fn example(envelope: marketsync_core::event::EventEnvelope)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("search-projection")
//!     .build()?;
//!
//! bus.publish("auction-events", &envelope).await?;
//!
//! let mut stream = bus.subscribe(&["auction-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(envelope) => println!("received {}", envelope.event_type),
//!         Err(e) => eprintln!("stream error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use marketsync_core::bus::{BusError, MessageBus, MessageStream};
use marketsync_core::event::EventEnvelope;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Kafka-compatible message bus.
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Producer settings**: acks, compression, send timeout
/// - **Consumer group**: explicit id, or auto-generated from topics
/// - **Buffer size**: envelope buffer per subscription (default: 1000)
/// - **Offset reset**: where new groups start reading (default: "latest")
///
/// All of it is host-supplied through [`RedpandaBusBuilder`]; nothing is
/// hardcoded beyond the defaults.
pub struct RedpandaBus {
    /// Kafka producer for publishing envelopes
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer send timeout
    timeout: Duration,
    /// Consumer group ID (if explicitly set)
    consumer_group: Option<String>,
    /// Envelope buffer size for subscribers
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be
    /// created from the given broker list.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all". A publish only counts as delivered once the broker
    /// has durably accepted it, because the dispatcher marks outbox rows
    /// sent on the strength of this acknowledgement.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// Each consumer (search projection, fault observer, …) should use its
    /// own group so it tracks progress independently; instances sharing a
    /// group share the workload.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the envelope buffer size for subscriptions.
    ///
    /// Bounds in-flight work per consumer: the Kafka reader blocks once the
    /// subscriber falls this far behind.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set the auto offset reset policy: "earliest", "latest" or "error".
    ///
    /// Default: "latest". New consumers that must see history use
    /// "earliest", though the reconciliation path makes that optional, since
    /// a cold projection can also converge by backfilling over HTTP.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("all"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("all"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "RedpandaBus created"
        );

        Ok(RedpandaBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl MessageBus for RedpandaBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        // Clone data before moving into the async block
        let topic = topic.to_string();
        let envelope = envelope.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = envelope.to_bytes().map_err(|e| BusError::PublishFailed {
                topic: topic.clone(),
                reason: format!("Failed to serialize envelope: {e}"),
            })?;

            // Key by aggregate id: every event for one auction lands in the
            // same partition and stays ordered relative to its siblings.
            let key = envelope.aggregate_id.to_string();

            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            let send_result = self.producer.send(record, Timeout::After(timeout)).await;

            match send_result {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        event_type = %envelope.event_type,
                        message_id = %envelope.message_id,
                        "Envelope published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        error = %kafka_error,
                        message_id = %envelope.message_id,
                        "Failed to publish envelope"
                    );
                    Err(BusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        // Clone configuration before moving into the async block
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            // If no group was configured, derive one from the sorted topic
            // list so repeated subscriptions resume the same offsets.
            let consumer_group_id = if let Some(group) = consumer_group {
                group
            } else {
                let mut sorted_topics = topics.clone();
                sorted_topics.sort();
                format!("marketsync-{}", sorted_topics.join("-"))
            };

            // Manual commit for at-least-once delivery
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size = buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            // The channel bounds in-flight envelopes per subscription.
            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // Spawn a task that owns the consumer and forwards envelopes.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(message) => {
                            let envelope_result = match message.payload() {
                                Some(payload) => EventEnvelope::from_bytes(payload).map_err(|e| {
                                    BusError::DeserializationFailed(format!(
                                        "Failed to decode envelope: {e}"
                                    ))
                                }),
                                None => Err(BusError::DeserializationFailed(
                                    "Message has no payload".to_string(),
                                )),
                            };

                            // Only commit AFTER the envelope was handed over;
                            // a crash in between redelivers, which consumers
                            // absorb through the inbox.
                            if tx.send(envelope_result).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }

                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err =
                                BusError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}
