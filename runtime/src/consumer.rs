//! Bus consumer driving an idempotent applier.
//!
//! The worker owns the subscribe-process-reconnect loop and the per-message
//! retry budget. The applier decides what an envelope means; the worker only
//! decides what happens when applying keeps failing: after the configured
//! attempts the message goes to the fault topic and the stream moves on, so
//! one poison message never blocks its queue.

use marketsync_core::apply::EventApplier;
use marketsync_core::bus::MessageBus;
use marketsync_core::event::EventEnvelope;
use marketsync_core::fault::FaultEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::retry::{RetryPolicy, retry_with_backoff};

/// Worker configuration, host-supplied.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Topics to subscribe to.
    pub topics: Vec<String>,
    /// Delivery attempts per message before dead-lettering.
    pub retry_attempts: u32,
    /// Pause between delivery attempts.
    pub retry_interval: Duration,
    /// Where exhausted messages go.
    pub fault_topic: String,
    /// Policy for establishing (and re-establishing) the subscription.
    /// Bounded fails the worker after N attempts; unbounded waits out any
    /// broker outage. Both are legitimate, which is why it is a knob.
    pub reconnect: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            topics: vec!["auction-events".to_string()],
            retry_attempts: 5,
            retry_interval: Duration::from_secs(5),
            fault_topic: "auction-events-faults".to_string(),
            reconnect: RetryPolicy::forever(Duration::from_secs(5)),
        }
    }
}

/// Subscribes to the bus and feeds envelopes through an [`EventApplier`].
///
/// # Example
///
/// ```ignore
/// let worker = ProjectionWorker::new(bus, projection, WorkerConfig::default());
/// let handle = worker.spawn(shutdown_rx);
/// ```
pub struct ProjectionWorker {
    bus: Arc<dyn MessageBus>,
    applier: Arc<dyn EventApplier>,
    config: WorkerConfig,
}

impl ProjectionWorker {
    /// Create a worker over the given bus and applier.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        applier: Arc<dyn EventApplier>,
        config: WorkerConfig,
    ) -> Self {
        Self { bus, applier, config }
    }

    /// Apply one envelope, retrying and dead-lettering per configuration.
    ///
    /// Never returns an error: every terminal outcome is either a successful
    /// apply (including duplicate/stale/ignored) or a message routed to the
    /// fault topic. The consumer process stays healthy either way.
    pub async fn process_one(&self, envelope: &EventEnvelope) {
        let mut attempt: u32 = 1;
        loop {
            match self.applier.apply(envelope).await {
                Ok(outcome) => {
                    tracing::trace!(
                        message_id = %envelope.message_id,
                        event_type = %envelope.event_type,
                        outcome = ?outcome,
                        "Envelope applied"
                    );
                    return;
                }
                Err(e) if attempt < self.config.retry_attempts => {
                    warn!(
                        message_id = %envelope.message_id,
                        attempt,
                        error = %e,
                        "Apply failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.dead_letter(envelope, &e.to_string(), attempt).await;
                    return;
                }
            }
        }
    }

    async fn dead_letter(&self, envelope: &EventEnvelope, reason: &str, attempts: u32) {
        error!(
            message_id = %envelope.message_id,
            event_type = %envelope.event_type,
            consumer = self.applier.consumer_name(),
            attempts,
            reason,
            "Message exhausted retries, routing to fault topic"
        );
        metrics::counter!("consumer.faulted", "event_type" => envelope.event_type.clone())
            .increment(1);

        let fault = FaultEnvelope::new(
            envelope.clone(),
            self.applier.consumer_name(),
            reason,
            attempts,
        );
        let wire = match fault.to_envelope() {
            Ok(wire) => wire,
            Err(e) => {
                error!(error = %e, "Failed to encode fault envelope");
                return;
            }
        };

        // A short bounded retry: if the fault topic itself is unreachable the
        // message is dropped from the pipeline with a log trail, rather than
        // wedging the whole queue behind it.
        let publish = retry_with_backoff(
            RetryPolicy::fixed(Duration::from_secs(1), 3),
            || self.bus.publish(&self.config.fault_topic, &wire),
        )
        .await;

        if let Err(e) = publish {
            error!(
                message_id = %envelope.message_id,
                error = %e,
                "Failed to publish to fault topic; message dropped"
            );
        }
    }

    /// Spawn the worker as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        use futures::StreamExt;

        info!(
            consumer = self.applier.consumer_name(),
            topics = ?self.config.topics,
            "Projection worker started"
        );

        loop {
            let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();

            let subscribe = retry_with_backoff(self.config.reconnect.clone(), || {
                self.bus.subscribe(&topics)
            });

            tokio::select! {
                _ = shutdown.recv() => {
                    info!(consumer = self.applier.consumer_name(), "Projection worker received shutdown signal");
                    break;
                }
                subscribed = subscribe => {
                    let mut stream = match subscribed {
                        Ok(stream) => stream,
                        Err(e) => {
                            // Only reachable with a bounded reconnect policy.
                            error!(
                                consumer = self.applier.consumer_name(),
                                error = %e,
                                "Subscription retries exhausted, stopping worker"
                            );
                            break;
                        }
                    };

                    info!(
                        consumer = self.applier.consumer_name(),
                        topics = ?self.config.topics,
                        "Subscribed to bus"
                    );

                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                info!(
                                    consumer = self.applier.consumer_name(),
                                    "Projection worker received shutdown signal during processing"
                                );
                                return;
                            }
                            next = stream.next() => {
                                match next {
                                    Some(Ok(envelope)) => {
                                        // In-flight work finishes before the
                                        // next envelope is taken.
                                        self.process_one(&envelope).await;
                                    }
                                    Some(Err(e)) => {
                                        warn!(
                                            consumer = self.applier.consumer_name(),
                                            error = %e,
                                            "Transport error on stream"
                                        );
                                    }
                                    None => {
                                        warn!(
                                            consumer = self.applier.consumer_name(),
                                            "Stream ended, resubscribing"
                                        );
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    tokio::time::sleep(self.config.reconnect.initial_delay).await;
                }
            }
        }

        info!(consumer = self.applier.consumer_name(), "Projection worker stopped");
    }
}
