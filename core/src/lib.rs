//! # Marketsync Core
//!
//! Core events, wire contracts and component traits for Marketsync, the
//! machinery that keeps a denormalized search projection consistent with the
//! authoritative auction store without a distributed transaction.
//!
//! ## Core Concepts
//!
//! - **Outbox**: an event record committed in the same local transaction as
//!   the aggregate change it describes ([`outbox`])
//! - **Bus**: at-least-once publish/subscribe transport for envelopes
//!   ([`bus`])
//! - **Applier**: consumer-side idempotent apply with an inbox guard and
//!   version compare ([`apply`])
//! - **Source**: direct watermark query against the owning service, for
//!   catch-up without the bus ([`source`])
//! - **Fault**: dead-letter contract for poison messages ([`fault`])
//!
//! ## Guarantees
//!
//! The pipeline gives **exactly-once effect**, not exactly-once delivery:
//! duplicates are expected at every seam (dispatcher crash after broker ack,
//! broker redelivery, overlapping backfill) and are absorbed by the inbox
//! uniqueness constraint plus monotonic version compares.
//!
//! ## Example
//!
//! ```ignore
//! use marketsync_core::{bus::MessageBus, event::EventEnvelope};
//!
//! async fn relay(bus: &dyn MessageBus, envelope: &EventEnvelope) {
//!     if bus.publish("auction-events", envelope).await.is_err() {
//!         // Leave the outbox row unsent; the next dispatcher tick retries.
//!     }
//! }
//! ```

pub mod apply;
pub mod bus;
pub mod event;
pub mod fault;
pub mod outbox;
pub mod source;

pub use apply::{ApplyOutcome, EventApplier, ProjectionError};
pub use bus::{BusError, MessageBus, MessageStream};
pub use event::{AuctionEvent, EventEnvelope, EventError};
pub use fault::FaultEnvelope;
pub use outbox::{OutboxError, OutboxMessage, OutboxStore};
pub use source::{AuctionSnapshot, SourceError, SourceReader};
