//! In-memory search projection and a failure-injecting wrapper.
//!
//! [`MemorySearchProjection`] applies envelopes with the same discipline as
//! the `PostgreSQL` projector: inbox-first deduplication, then the
//! [`SearchItem`] fold rules. Pipeline tests observe identical outcomes.
//! [`FlakyApplier`] wraps any applier to inject poison messages and transient
//! failures for retry and dead-letter tests.

use chrono::{DateTime, Utc};
use marketsync_core::apply::{ApplyOutcome, EventApplier, ProjectionError};
use marketsync_core::event::{AuctionEvent, EventEnvelope};
use marketsync_projections::SearchItem;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct State {
    inbox: HashSet<Uuid>,
    items: HashMap<Uuid, SearchItem>,
}

/// In-memory stand-in for the search projection.
pub struct MemorySearchProjection {
    consumer_name: String,
    state: Mutex<State>,
}

impl MemorySearchProjection {
    /// Create an empty projection for the given consumer name.
    #[must_use]
    pub fn new(consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Fetch one document by auction id.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn get(&self, id: Uuid) -> Option<SearchItem> {
        self.state.lock().expect("lock poisoned").items.get(&id).cloned()
    }

    /// All documents, unordered.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn items(&self) -> Vec<SearchItem> {
        self.state
            .lock()
            .expect("lock poisoned")
            .items
            .values()
            .cloned()
            .collect()
    }

    fn fold(state: &mut State, event: &AuctionEvent, version: i64) -> ApplyOutcome {
        use std::collections::hash_map::Entry;

        match event {
            AuctionEvent::Created(e) => match state.items.entry(e.id) {
                Entry::Occupied(mut entry) => {
                    if entry.get_mut().apply_created(e, version) {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::Stale
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(SearchItem::from_created(e, version));
                    ApplyOutcome::Applied
                }
            },
            AuctionEvent::Updated(e) => match state.items.get_mut(&e.id) {
                Some(item) => {
                    if item.apply_updated(e, version) {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::Stale
                    }
                }
                None => ApplyOutcome::Stale,
            },
            AuctionEvent::Deleted(e) => {
                state.items.remove(&e.id);
                ApplyOutcome::Applied
            }
            AuctionEvent::Finished(e) => match state.items.get_mut(&e.auction_id) {
                Some(item) => {
                    if item.apply_finished(e, version) {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::Stale
                    }
                }
                None => ApplyOutcome::Stale,
            },
            AuctionEvent::BidPlaced(e) => {
                if !e.bid_status.contains("Accepted") {
                    return ApplyOutcome::Ignored;
                }
                match state.items.get_mut(&e.auction_id) {
                    Some(item) => {
                        if item.apply_bid(e) {
                            ApplyOutcome::Applied
                        } else {
                            ApplyOutcome::Stale
                        }
                    }
                    None => ApplyOutcome::Stale,
                }
            }
        }
    }
}

impl EventApplier for MemorySearchProjection {
    fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn apply(
        &self,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, ProjectionError>> + Send + '_>> {
        let envelope = envelope.clone();

        Box::pin(async move {
            let event = AuctionEvent::from_envelope(&envelope)
                .map_err(|e| ProjectionError::Payload(e.to_string()))?;

            let mut state = self
                .state
                .lock()
                .map_err(|_| ProjectionError::Storage("lock poisoned".to_string()))?;

            // Inbox first: a message id seen before must not touch the items.
            if !state.inbox.insert(envelope.message_id) {
                return Ok(ApplyOutcome::Duplicate);
            }

            let outcome = match &event {
                Some(event) => Self::fold(&mut state, event, envelope.version),
                None => ApplyOutcome::Ignored,
            };

            Ok(outcome)
        })
    }

    fn watermark(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, ProjectionError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self
                .state
                .lock()
                .map_err(|_| ProjectionError::Storage("lock poisoned".to_string()))?;

            Ok(state.items.values().map(|item| item.updated_at).max())
        })
    }
}

/// Wraps an applier to inject failures.
///
/// Aggregates marked as poison fail on every attempt (a handler bug, a
/// payload the projector cannot process); transient failures fail the next N
/// attempts across the wrapper, then clear.
pub struct FlakyApplier<A> {
    inner: Arc<A>,
    poison: Mutex<HashSet<Uuid>>,
    transient_failures: AtomicUsize,
}

impl<A: EventApplier> FlakyApplier<A> {
    /// Wrap an applier with no failures configured.
    #[must_use]
    pub fn new(inner: Arc<A>) -> Self {
        Self {
            inner,
            poison: Mutex::new(HashSet::new()),
            transient_failures: AtomicUsize::new(0),
        }
    }

    /// Make every envelope for this aggregate fail, forever.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::expect_used)]
    pub fn poison(&self, aggregate_id: Uuid) {
        self.poison.lock().expect("lock poisoned").insert(aggregate_id);
    }

    /// Fail the next `count` applies, whatever their aggregate.
    pub fn set_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }
}

impl<A: EventApplier> EventApplier for FlakyApplier<A> {
    fn consumer_name(&self) -> &str {
        self.inner.consumer_name()
    }

    fn apply(
        &self,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, ProjectionError>> + Send + '_>> {
        let envelope = envelope.clone();

        Box::pin(async move {
            let poisoned = self
                .poison
                .lock()
                .map_err(|_| ProjectionError::Storage("lock poisoned".to_string()))?
                .contains(&envelope.aggregate_id);
            if poisoned {
                return Err(ProjectionError::Storage(
                    "simulated poison message".to_string(),
                ));
            }

            let remaining = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if remaining {
                return Err(ProjectionError::Storage(
                    "simulated transient failure".to_string(),
                ));
            }

            self.inner.apply(&envelope).await
        })
    }

    fn watermark(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, ProjectionError>> + Send + '_>>
    {
        self.inner.watermark()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use marketsync_core::event::{AuctionCreated, AuctionUpdated};

    fn created_envelope(id: Uuid, version: i64) -> EventEnvelope {
        let event = AuctionEvent::Created(AuctionCreated {
            id,
            seller: "alice".to_string(),
            winner: None,
            reserve_price: 20_000,
            sold_amount: None,
            current_high_bid: None,
            auction_end: Utc::now(),
            status: "Live".to_string(),
            make: "Ford".to_string(),
            model: "GT".to_string(),
            year: 2020,
            color: "White".to_string(),
            mileage: 50_000,
            image_url: "https://example.com/gt.jpg".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        EventEnvelope::new(&event, version).unwrap()
    }

    fn updated_envelope(id: Uuid, version: i64, color: &str) -> EventEnvelope {
        let event = AuctionEvent::Updated(AuctionUpdated {
            id,
            make: None,
            model: None,
            year: None,
            color: Some(color.to_string()),
            mileage: None,
            updated_at: Utc::now(),
        });
        EventEnvelope::new(&event, version).unwrap()
    }

    #[tokio::test]
    async fn applying_the_same_message_twice_changes_nothing() {
        let projection = MemorySearchProjection::new("search-projection");
        let id = Uuid::new_v4();
        let envelope = created_envelope(id, 1);

        assert_eq!(
            projection.apply(&envelope).await.unwrap(),
            ApplyOutcome::Applied
        );
        let before = projection.get(id).unwrap();

        assert_eq!(
            projection.apply(&envelope).await.unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(projection.get(id).unwrap(), before);
    }

    #[tokio::test]
    async fn out_of_order_redelivery_keeps_the_newer_state() {
        let projection = MemorySearchProjection::new("search-projection");
        let id = Uuid::new_v4();

        projection.apply(&created_envelope(id, 1)).await.unwrap();
        projection
            .apply(&updated_envelope(id, 5, "Black"))
            .await
            .unwrap();

        let outcome = projection
            .apply(&updated_envelope(id, 3, "Green"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(projection.get(id).unwrap().color, "Black");
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored() {
        let projection = MemorySearchProjection::new("search-projection");
        let envelope = EventEnvelope {
            message_id: Uuid::new_v4(),
            event_type: "AuctionRelisted".to_string(),
            aggregate_id: Uuid::new_v4(),
            version: 1,
            payload: serde_json::json!({}),
        };

        assert_eq!(
            projection.apply(&envelope).await.unwrap(),
            ApplyOutcome::Ignored
        );
        assert!(projection.items().is_empty());
    }

    #[tokio::test]
    async fn flaky_applier_clears_after_transient_failures() {
        let inner = Arc::new(MemorySearchProjection::new("search-projection"));
        let flaky = FlakyApplier::new(Arc::clone(&inner));
        flaky.set_transient_failures(2);

        let envelope = created_envelope(Uuid::new_v4(), 1);
        assert!(flaky.apply(&envelope).await.is_err());
        assert!(flaky.apply(&envelope).await.is_err());
        assert_eq!(
            flaky.apply(&envelope).await.unwrap(),
            ApplyOutcome::Applied
        );
    }
}
