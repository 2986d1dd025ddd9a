//! Periodic outbox dispatcher.
//!
//! One background task per service instance: every tick it claims a batch of
//! unsent rows, publishes each to the bus, and marks sent exactly the rows
//! the broker acknowledged. There is no per-row retry counter: a failed
//! publish leaves the row unsent and the next tick tries again, which is the
//! whole at-least-once story on the producing side.
//!
//! A crash anywhere in a tick is safe: between claim and publish the lease
//! lapses and another instance picks the row up; between broker ack and
//! mark-sent the row is republished with the same message id, which the
//! consumers' inbox absorbs. Lost delivery is the only failure mode this
//! design rules out, and duplicate delivery is the accepted price.

use marketsync_core::bus::MessageBus;
use marketsync_core::outbox::{OutboxError, OutboxStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Dispatcher configuration, host-supplied.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Topic unsent rows are published to.
    pub topic: String,
    /// How often the outbox is polled.
    pub poll_interval: Duration,
    /// Maximum rows claimed per tick.
    pub batch_size: usize,
    /// How long a claim excludes other dispatcher instances. Must comfortably
    /// exceed the worst-case publish time for a full batch.
    pub lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            topic: "auction-events".to_string(),
            poll_interval: Duration::from_secs(10),
            batch_size: 50,
            lease: Duration::from_secs(30),
        }
    }
}

/// Drains the outbox into the bus on a fixed interval.
///
/// # Example
///
/// ```ignore
/// let dispatcher = OutboxDispatcher::new(store, bus, DispatcherConfig::default());
/// let handle = dispatcher.spawn(shutdown_rx);
/// ```
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    /// Create a dispatcher over the given store and bus.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn MessageBus>,
        config: DispatcherConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    /// Run one claim-publish-mark cycle; returns how many rows were marked
    /// sent.
    ///
    /// Rows whose publish failed are left unsent for the next tick. A row is
    /// never marked sent before the broker acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the claim or the mark-sent update fails.
    /// Rows already published in this tick stay unsent in that case and will
    /// be republished; consumers deduplicate them.
    pub async fn tick(&self) -> Result<usize, OutboxError> {
        let batch = self
            .store
            .claim_batch(self.config.batch_size, self.config.lease)
            .await?;

        if batch.is_empty() {
            return Ok(0);
        }

        let mut acked: Vec<Uuid> = Vec::with_capacity(batch.len());
        for message in &batch {
            match self.bus.publish(&self.config.topic, &message.envelope()).await {
                Ok(()) => acked.push(message.id),
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        error = %e,
                        "Publish failed, leaving row unsent for next tick"
                    );
                    metrics::counter!("outbox.publish_failed").increment(1);
                }
            }
        }

        if !acked.is_empty() {
            self.store.mark_sent(&acked).await?;
            metrics::counter!("outbox.dispatched").increment(acked.len() as u64);
        }

        Ok(acked.len())
    }

    /// Spawn the dispatcher as a background task.
    ///
    /// The task polls until a shutdown signal arrives; an in-flight tick is
    /// allowed to finish, and whatever it did not complete is simply picked
    /// up on the next start.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            topic = %self.config.topic,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Outbox dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Outbox dispatcher received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(dispatched) => {
                            tracing::debug!(dispatched, "Outbox tick complete");
                        }
                        Err(e) => {
                            // Transient by contract: rows stay unsent and the
                            // next tick retries.
                            error!(error = %e, "Outbox tick failed");
                        }
                    }
                }
            }
        }

        info!("Outbox dispatcher stopped");
    }
}
