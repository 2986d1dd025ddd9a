//! `PostgreSQL` outbox storage for Marketsync.
//!
//! This crate provides the write-side half of the delivery pipeline: the
//! [`PgOutboxStore`] that the auction service appends to inside its own
//! transactions and that the dispatcher drains with lease-based claims.
//!
//! # Example
//!
//! ```ignore
//! use marketsync_postgres::PgOutboxStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PgOutboxStore::connect("postgres://localhost/auctions").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox;

pub use outbox::PgOutboxStore;
