//! In-memory message bus.
//!
//! Delivers envelopes to subscribers registered before the publish, records
//! every publication for assertions, and can be told to refuse publishes to
//! simulate a broker outage. Like the real bus it promises nothing about
//! replaying history to late subscribers.

use marketsync_core::bus::{BusError, MessageBus, MessageStream};
use marketsync_core::event::EventEnvelope;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

type Subscribers = HashMap<String, Vec<mpsc::Sender<Result<EventEnvelope, BusError>>>>;

/// In-memory stand-in for the broker.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Subscribers>,
    published: Mutex<Vec<(String, EventEnvelope)>>,
    fail_publishes: AtomicBool,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every publish while `fail` is set, as an unreachable broker
    /// would.
    pub fn set_publish_failures(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every envelope successfully published, in order, with its topic.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().expect("lock poisoned").clone()
    }

    /// Envelopes published to one topic, in order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<EventEnvelope> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope)
            .collect()
    }
}

impl MessageBus for MemoryBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();

        Box::pin(async move {
            if self.fail_publishes.load(Ordering::SeqCst) {
                return Err(BusError::PublishFailed {
                    topic,
                    reason: "simulated broker outage".to_string(),
                });
            }

            // Snapshot the senders so no lock is held across the await.
            let senders = {
                let subscribers = self
                    .subscribers
                    .lock()
                    .map_err(|_| BusError::TransportError("lock poisoned".to_string()))?;
                subscribers.get(&topic).cloned().unwrap_or_default()
            };

            {
                let mut published = self
                    .published
                    .lock()
                    .map_err(|_| BusError::TransportError("lock poisoned".to_string()))?;
                published.push((topic.clone(), envelope.clone()));
            }

            for sender in senders {
                // A dropped subscriber is not a publish failure.
                let _ = sender.send(Ok(envelope.clone())).await;
            }

            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let (tx, rx) = mpsc::channel(1024);

            {
                let mut subscribers = self
                    .subscribers
                    .lock()
                    .map_err(|_| BusError::TransportError("lock poisoned".to_string()))?;
                for topic in &topics {
                    subscribers.entry(topic.clone()).or_default().push(tx.clone());
                }
            }

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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use marketsync_core::event::{AuctionDeleted, AuctionEvent};
    use uuid::Uuid;

    fn envelope() -> EventEnvelope {
        let event = AuctionEvent::Deleted(AuctionDeleted { id: Uuid::new_v4() });
        EventEnvelope::new(&event, 1).unwrap()
    }

    #[tokio::test]
    async fn delivers_to_matching_subscribers() {
        let bus = MemoryBus::new();
        let mut stream = bus.subscribe(&["auction-events"]).await.unwrap();

        let sent = envelope();
        bus.publish("auction-events", &sent).await.unwrap();
        bus.publish("other-events", &envelope()).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received, sent);
        assert_eq!(bus.published_to("auction-events").len(), 1);
    }

    #[tokio::test]
    async fn simulated_outage_fails_publishes() {
        let bus = MemoryBus::new();
        bus.set_publish_failures(true);

        let result = bus.publish("auction-events", &envelope()).await;
        assert!(matches!(result, Err(BusError::PublishFailed { .. })));
        assert!(bus.published().is_empty());

        bus.set_publish_failures(false);
        bus.publish("auction-events", &envelope()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }
}
