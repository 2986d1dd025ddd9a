//! Search read model for Marketsync.
//!
//! # Overview
//!
//! This crate is the consumer half of the pipeline:
//! - [`SearchItem`]: the denormalized auction document and its fold rules
//! - [`PgSearchProjection`]: idempotent applier, inbox guard plus version
//!   compare, both inside one `PostgreSQL` transaction
//! - [`HttpSourceReader`]: direct read access to the auction service for
//!   watermark-based backfill
//!
//! # Consistency Model
//!
//! The projection is eventually consistent and rebuildable. Events may arrive
//! late, twice, or not at all (until reconciliation fetches them); the
//! document converges regardless because every apply is deduplicated by
//! message id and ordered by aggregate version.
//!
//! ```text
//! Auction Service DB               Search DB
//! ┌─────────────────┐   events    ┌──────────────────┐
//! │  auctions       │  ────────►  │  search_items    │
//! │  outbox         │    bus      │  inbox_records   │
//! └───────┬─────────┘             └────────▲─────────┘
//!         │        HTTP backfill           │
//!         └─────────────────────────────────
//! ```

mod item;
mod postgres;
mod source;

pub use item::SearchItem;
pub use postgres::PgSearchProjection;
pub use source::HttpSourceReader;
