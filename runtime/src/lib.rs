//! # Marketsync Runtime
//!
//! Background machinery for the Marketsync pipeline.
//!
//! ## Core Components
//!
//! - **[`OutboxDispatcher`]**: periodic task draining the outbox into the bus
//! - **[`ProjectionWorker`]**: subscribe-process-reconnect loop feeding an
//!   idempotent applier, with per-message retry and dead-lettering
//! - **[`FaultConsumer`]**: observes the fault topic, never re-injects
//! - **[`Synchronizer`]**: watermark-based catch-up against the owning
//!   service when the bus was not enough
//! - **[`retry`]**: bounded and unbounded backoff shared by all of the above
//!
//! ## Lifecycle
//!
//! Every component spawns from a `broadcast` shutdown channel and drains
//! gracefully: in-flight publishes and applies finish, interrupted batches
//! are simply resumed by the next tick or the lease expiry.
//!
//! ```ignore
//! let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//!
//! let dispatcher = OutboxDispatcher::new(store, bus.clone(), DispatcherConfig::default());
//! let worker = ProjectionWorker::new(bus.clone(), projection.clone(), WorkerConfig::default());
//! let sync = Synchronizer::new(source, projection, SyncConfig::default());
//!
//! let handles = vec![
//!     dispatcher.spawn(shutdown_tx.subscribe()),
//!     worker.spawn(shutdown_tx.subscribe()),
//!     sync.spawn(shutdown_tx.subscribe()),
//! ];
//! ```

/// Retry with bounded or unbounded backoff
pub mod retry;

/// Periodic outbox dispatcher
pub mod dispatcher;

/// Bus consumer with per-message retry and dead-lettering
pub mod consumer;

/// Fault topic observer
pub mod fault;

/// Watermark-based reconciliation
pub mod sync;

pub use consumer::{ProjectionWorker, WorkerConfig};
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use fault::FaultConsumer;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use sync::{SyncConfig, SyncError, Synchronizer};
