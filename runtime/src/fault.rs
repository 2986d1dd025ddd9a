//! Fault topic observer.
//!
//! A degenerate consumer: it decodes each fault, logs it loudly, counts it,
//! and keeps a small in-memory window for operator tooling to inspect. It
//! never re-injects a message into the pipeline; automatic replay of a
//! poison message is an infinite loop with extra steps, so replay stays a
//! human decision.

use marketsync_core::bus::MessageBus;
use marketsync_core::fault::FaultEnvelope;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::retry::{RetryPolicy, retry_with_backoff};

/// How many recent faults are kept for inspection.
const RECENT_FAULTS_CAPACITY: usize = 100;

/// Observes the fault topic and surfaces terminally-failed messages.
pub struct FaultConsumer {
    bus: Arc<dyn MessageBus>,
    topic: String,
    reconnect: RetryPolicy,
    recent: Arc<Mutex<VecDeque<FaultEnvelope>>>,
}

impl FaultConsumer {
    /// Create a fault observer bound to the given topic.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            reconnect: RetryPolicy::forever(Duration::from_secs(5)),
            recent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Override the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// The most recent faults, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn recent(&self) -> Vec<FaultEnvelope> {
        self.recent
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Record one fault: log, count, retain.
    pub fn observe(&self, fault: FaultEnvelope) {
        error!(
            consumer = %fault.consumer,
            event_type = %fault.envelope.event_type,
            message_id = %fault.envelope.message_id,
            aggregate_id = %fault.envelope.aggregate_id,
            attempts = fault.attempts,
            reason = %fault.reason,
            "Dead-lettered message observed"
        );
        metrics::counter!("fault.observed", "consumer" => fault.consumer.clone()).increment(1);

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_FAULTS_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(fault);
        }
    }

    /// Spawn the observer as a background task.
    ///
    /// Takes `Arc<Self>` so callers (and operator tooling) can keep a handle
    /// for [`FaultConsumer::recent`] while the task runs.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        use futures::StreamExt;

        info!(topic = %self.topic, "Fault consumer started");

        loop {
            let subscribe = retry_with_backoff(self.reconnect.clone(), || {
                self.bus.subscribe(&[self.topic.as_str()])
            });

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Fault consumer received shutdown signal");
                    break;
                }
                subscribed = subscribe => {
                    let mut stream = match subscribed {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!(error = %e, "Fault subscription retries exhausted");
                            break;
                        }
                    };

                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                info!("Fault consumer received shutdown signal during processing");
                                return;
                            }
                            next = stream.next() => {
                                match next {
                                    Some(Ok(envelope)) => {
                                        match FaultEnvelope::from_envelope(&envelope) {
                                            Ok(fault) => self.observe(fault),
                                            Err(e) => {
                                                // Whatever it is, it must not
                                                // crash the observer.
                                                warn!(
                                                    message_id = %envelope.message_id,
                                                    error = %e,
                                                    "Non-fault message on fault topic"
                                                );
                                            }
                                        }
                                    }
                                    Some(Err(e)) => {
                                        warn!(error = %e, "Transport error on fault stream");
                                    }
                                    None => {
                                        warn!("Fault stream ended, resubscribing");
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    tokio::time::sleep(self.reconnect.initial_delay).await;
                }
            }
        }

        info!("Fault consumer stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use marketsync_core::event::EventEnvelope;
    use marketsync_testing::MemoryBus;
    use uuid::Uuid;

    fn fault(n: u32) -> FaultEnvelope {
        FaultEnvelope::new(
            EventEnvelope {
                message_id: Uuid::new_v4(),
                event_type: "AuctionCreated".to_string(),
                aggregate_id: Uuid::new_v4(),
                version: i64::from(n),
                payload: serde_json::json!({}),
            },
            "search-projection",
            "boom",
            5,
        )
    }

    #[test]
    fn recent_window_is_bounded() {
        let consumer = FaultConsumer::new(Arc::new(MemoryBus::new()), "faults");

        for n in 0..(RECENT_FAULTS_CAPACITY as u32 + 10) {
            consumer.observe(fault(n));
        }

        let recent = consumer.recent();
        assert_eq!(recent.len(), RECENT_FAULTS_CAPACITY);
        // Oldest entries were evicted first.
        assert_eq!(recent[0].envelope.version, 10);
    }
}
