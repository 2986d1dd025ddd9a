//! Pipeline tests over the in-memory doubles.
//!
//! These exercise the delivery guarantees end to end: rows survive broker
//! outages, duplicates from a crashed mark-sent are absorbed, poison
//! messages are isolated on the fault topic, and a projection converges
//! through the reconciliation path with the bus completely gone.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use marketsync_core::apply::{ApplyOutcome, EventApplier};
use marketsync_core::event::{AuctionCreated, AuctionEvent, EventEnvelope};
use marketsync_core::fault::FaultEnvelope;
use marketsync_core::source::AuctionSnapshot;
use marketsync_runtime::consumer::{ProjectionWorker, WorkerConfig};
use marketsync_runtime::dispatcher::{DispatcherConfig, OutboxDispatcher};
use marketsync_runtime::fault::FaultConsumer;
use marketsync_runtime::retry::RetryPolicy;
use marketsync_runtime::sync::{SyncConfig, Synchronizer};
use marketsync_testing::{
    FixedSourceReader, FlakyApplier, MemoryBus, MemoryOutboxStore, MemorySearchProjection,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

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

fn snapshot(id: Uuid, version: i64, seller: &str) -> AuctionSnapshot {
    AuctionSnapshot {
        id,
        version,
        seller: seller.to_string(),
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
    }
}

fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(20),
        lease: Duration::from_secs(5),
        ..DispatcherConfig::default()
    }
}

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        retry_attempts: 3,
        retry_interval: Duration::from_millis(10),
        reconnect: RetryPolicy::forever(Duration::from_millis(10)),
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn dispatcher_tick_delivers_and_marks_sent() {
    let store = MemoryOutboxStore::new();
    let bus = Arc::new(MemoryBus::new());

    let mut tx = store.begin();
    tx.append(&created_envelope(Uuid::new_v4(), 1));
    tx.append(&created_envelope(Uuid::new_v4(), 1));
    tx.commit();

    let dispatcher = OutboxDispatcher::new(
        Arc::new(store.clone()),
        bus.clone(),
        DispatcherConfig::default(),
    );

    let dispatched = dispatcher.tick().await.unwrap();
    assert_eq!(dispatched, 2);
    assert_eq!(bus.published_to("auction-events").len(), 2);
    assert_eq!(store.unsent_count(), 0);

    // Nothing left for the next tick.
    assert_eq!(dispatcher.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn broker_outage_leaves_rows_for_the_next_tick() {
    let store = MemoryOutboxStore::new();
    let bus = Arc::new(MemoryBus::new());
    bus.set_publish_failures(true);

    let mut tx = store.begin();
    tx.append(&created_envelope(Uuid::new_v4(), 1));
    tx.commit();

    let config = DispatcherConfig {
        // Zero lease so this test's second tick can reclaim immediately.
        lease: Duration::ZERO,
        ..DispatcherConfig::default()
    };
    let dispatcher = OutboxDispatcher::new(Arc::new(store.clone()), bus.clone(), config);

    assert_eq!(dispatcher.tick().await.unwrap(), 0);
    assert_eq!(store.unsent_count(), 1);
    assert!(bus.published().is_empty());

    // Broker comes back; the same row goes out untouched.
    bus.set_publish_failures(false);
    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    assert_eq!(store.unsent_count(), 0);
    assert_eq!(bus.published_to("auction-events").len(), 1);
}

#[tokio::test]
async fn ack_without_mark_sent_republishes_and_consumers_absorb_it() {
    let store = MemoryOutboxStore::new();
    let bus = Arc::new(MemoryBus::new());
    let id = Uuid::new_v4();

    let mut tx = store.begin();
    tx.append(&created_envelope(id, 1));
    tx.commit();

    let config = DispatcherConfig {
        lease: Duration::ZERO,
        ..DispatcherConfig::default()
    };
    let dispatcher = OutboxDispatcher::new(Arc::new(store.clone()), bus.clone(), config);

    // The broker acks but the dispatcher "crashes" before mark-sent.
    store.set_mark_sent_failures(true);
    assert!(dispatcher.tick().await.is_err());
    assert_eq!(bus.published_to("auction-events").len(), 1);
    assert_eq!(store.unsent_count(), 1);

    // Restarted dispatcher republishes the same message id.
    store.set_mark_sent_failures(false);
    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    let published = bus.published_to("auction-events");
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].message_id, published[1].message_id);

    // Delivered twice, applied once.
    let projection = MemorySearchProjection::new("search-projection");
    assert_eq!(
        projection.apply(&published[0]).await.unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(
        projection.apply(&published[1]).await.unwrap(),
        ApplyOutcome::Duplicate
    );
    assert_eq!(projection.items().len(), 1);
}

#[tokio::test]
async fn poison_message_is_dead_lettered_without_blocking_the_queue() {
    let bus = Arc::new(MemoryBus::new());
    let projection = Arc::new(MemorySearchProjection::new("search-projection"));
    let flaky = Arc::new(FlakyApplier::new(Arc::clone(&projection)));

    let poisoned = Uuid::new_v4();
    let healthy = Uuid::new_v4();
    flaky.poison(poisoned);

    let config = fast_worker_config();
    let fault_topic = config.fault_topic.clone();
    let retry_attempts = config.retry_attempts;
    let worker = ProjectionWorker::new(bus.clone(), flaky, config);

    worker.process_one(&created_envelope(poisoned, 1)).await;
    worker.process_one(&created_envelope(healthy, 1)).await;

    // The healthy message was applied even though the poisoned one never was.
    assert!(projection.get(healthy).is_some());
    assert!(projection.get(poisoned).is_none());

    // The poisoned message sits on the fault topic with its metadata.
    let faults = bus.published_to(&fault_topic);
    assert_eq!(faults.len(), 1);
    let fault = FaultEnvelope::from_envelope(&faults[0]).unwrap();
    assert_eq!(fault.envelope.aggregate_id, poisoned);
    assert_eq!(fault.attempts, retry_attempts);
    assert_eq!(fault.consumer, "search-projection");
    assert_eq!(faults[0].event_type, "AuctionCreated.fault");
}

#[tokio::test]
async fn transient_failures_recover_within_the_retry_budget() {
    let bus = Arc::new(MemoryBus::new());
    let projection = Arc::new(MemorySearchProjection::new("search-projection"));
    let flaky = Arc::new(FlakyApplier::new(Arc::clone(&projection)));
    flaky.set_transient_failures(2);

    let config = fast_worker_config();
    let fault_topic = config.fault_topic.clone();
    let worker = ProjectionWorker::new(bus.clone(), flaky, config);

    let id = Uuid::new_v4();
    worker.process_one(&created_envelope(id, 1)).await;

    assert!(projection.get(id).is_some());
    assert!(bus.published_to(&fault_topic).is_empty());
}

#[tokio::test]
async fn projection_converges_without_the_bus() {
    let records = vec![
        snapshot(Uuid::new_v4(), 1, "alice"),
        snapshot(Uuid::new_v4(), 1, "bob"),
        snapshot(Uuid::new_v4(), 3, "carol"),
    ];
    let source = Arc::new(FixedSourceReader::new(records));
    let projection = Arc::new(MemorySearchProjection::new("search-projection"));

    let synchronizer = Synchronizer::new(
        source,
        Arc::clone(&projection) as Arc<dyn EventApplier>,
        SyncConfig::default(),
    );

    let applied = synchronizer.backfill().await.unwrap();
    assert_eq!(applied, 3);
    assert_eq!(projection.items().len(), 3);

    // A second pass finds nothing new: the overlap at the watermark is
    // deduplicated and the watermark does not move.
    assert_eq!(synchronizer.backfill().await.unwrap(), 0);
    assert_eq!(projection.items().len(), 3);
}

#[tokio::test]
async fn backfill_waits_out_a_source_outage() {
    let source = Arc::new(FixedSourceReader::new(vec![
        snapshot(Uuid::new_v4(), 1, "alice"),
        snapshot(Uuid::new_v4(), 2, "bob"),
        snapshot(Uuid::new_v4(), 2, "carol"),
    ]));
    source.set_transient_failures(2);

    let projection = Arc::new(MemorySearchProjection::new("search-projection"));
    let synchronizer = Synchronizer::new(
        source,
        Arc::clone(&projection) as Arc<dyn EventApplier>,
        SyncConfig {
            retry: RetryPolicy::forever(Duration::from_millis(5)),
            interval: None,
        },
    );

    let applied = synchronizer.converge().await.unwrap();
    assert_eq!(applied, 3);
    assert_eq!(projection.items().len(), 3);
}

#[tokio::test]
async fn fault_consumer_surfaces_dead_letters() {
    let bus = Arc::new(MemoryBus::new());
    let projection = Arc::new(MemorySearchProjection::new("search-projection"));
    let flaky = Arc::new(FlakyApplier::new(Arc::clone(&projection)));

    let poisoned = Uuid::new_v4();
    flaky.poison(poisoned);

    let config = fast_worker_config();
    let fault_topic = config.fault_topic.clone();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let observer = Arc::new(
        FaultConsumer::new(bus.clone(), fault_topic)
            .with_reconnect(RetryPolicy::forever(Duration::from_millis(10))),
    );
    let observer_handle = Arc::clone(&observer).spawn(shutdown_tx.subscribe());

    // Let the observer subscribe before the fault is published.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let worker = ProjectionWorker::new(bus.clone(), flaky, config);
    worker.process_one(&created_envelope(poisoned, 1)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !observer.recent().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "fault was not observed in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let recent = observer.recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].envelope.aggregate_id, poisoned);
    assert_eq!(recent[0].reason, "Projection storage error: simulated poison message");

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), observer_handle)
        .await
        .expect("observer drained")
        .unwrap();
}

#[tokio::test]
async fn events_flow_from_outbox_to_projection() {
    let store = MemoryOutboxStore::new();
    let bus = Arc::new(MemoryBus::new());
    let projection = Arc::new(MemorySearchProjection::new("search-projection"));
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let worker = ProjectionWorker::new(
        bus.clone(),
        Arc::clone(&projection) as Arc<dyn EventApplier>,
        fast_worker_config(),
    );
    let worker_handle = worker.spawn(shutdown_tx.subscribe());

    // Give the worker a moment to subscribe; the in-memory bus does not
    // replay history to late subscribers.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = Uuid::new_v4();
    let mut tx = store.begin();
    tx.append(&created_envelope(id, 1));
    tx.commit();

    let dispatcher = OutboxDispatcher::new(
        Arc::new(store.clone()),
        bus.clone(),
        fast_dispatcher_config(),
    );
    let dispatcher_handle = dispatcher.spawn(shutdown_tx.subscribe());

    // Wait for convergence.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if projection.get(id).is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "projection did not converge in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(store.unsent_count(), 0);
    assert_eq!(projection.get(id).unwrap().seller, "alice");

    // Graceful drain.
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .expect("worker drained")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), dispatcher_handle)
        .await
        .expect("dispatcher drained")
        .unwrap();
}
