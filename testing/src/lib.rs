//! # Marketsync Testing
//!
//! In-memory test doubles for the Marketsync pipeline.
//!
//! Every double keeps the contract of its production counterpart where the
//! pipeline's guarantees depend on it:
//!
//! - [`MemoryOutboxStore`]: appends are transactional, claims are leased,
//!   `mark_sent` is idempotent, and can be made to fail on demand
//! - [`MemoryBus`]: delivers to registered subscribers, records publishes,
//!   and can simulate a broker outage
//! - [`MemorySearchProjection`]: inbox-first deduplication plus the shared
//!   document fold rules
//! - [`FlakyApplier`]: wraps an applier with poison and transient failures
//! - [`FixedSourceReader`]: watermark-honoring fixture for backfill tests
//!
//! # Example
//!
//! ```
//! use marketsync_testing::MemoryBus;
//! use marketsync_core::bus::MessageBus;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = MemoryBus::new();
//! let _stream = bus.subscribe(&["auction-events"]).await.unwrap();
//! # }
//! ```

pub mod bus;
pub mod outbox;
pub mod projection;
pub mod source;

pub use bus::MemoryBus;
pub use outbox::{MemoryOutboxStore, MemoryOutboxTransaction};
pub use projection::{FlakyApplier, MemorySearchProjection};
pub use source::FixedSourceReader;
