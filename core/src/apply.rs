//! Idempotent event application contract for read models.
//!
//! A consumer applies each envelope in one local transaction that covers both
//! the inbox record and the read-model mutation. The four outcomes below are
//! all success from the delivery pipeline's point of view; only an `Err` is
//! retried and eventually dead-lettered.

use crate::event::EventEnvelope;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while applying an envelope to a read model.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// Read-model or inbox storage failed.
    #[error("Projection storage error: {0}")]
    Storage(String),

    /// The payload named a known event type but could not be decoded.
    #[error("Projection payload error: {0}")]
    Payload(String),
}

/// What happened to an envelope that was applied successfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The read model was mutated.
    Applied,
    /// This message id was seen before; nothing was touched.
    Duplicate,
    /// The envelope carried an older version than the entity already has.
    Stale,
    /// The event type is outside this consumer's catalogue.
    Ignored,
}

/// A read model that applies envelopes exactly-once in effect.
///
/// # Contract
///
/// Within one local transaction, implementations must:
///
/// 1. insert the `(message_id, consumer_name)` inbox record; a uniqueness
///    violation means the envelope was already applied: return
///    [`ApplyOutcome::Duplicate`] without touching the read model;
/// 2. mutate the read model according to the event's semantics, guarding
///    every non-commutative mutation with a monotonic version compare so a
///    redelivered older envelope lands as [`ApplyOutcome::Stale`];
/// 3. commit both writes together.
///
/// Both the bus consumer and the reconciliation backfill drive the same
/// implementation, so deduplication and ordering behave identically whichever
/// path an event arrives by.
pub trait EventApplier: Send + Sync {
    /// Durable name of this consumer; part of the inbox key.
    fn consumer_name(&self) -> &str;

    /// Apply one envelope, idempotently.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] only for failures worth retrying
    /// (storage trouble, malformed payload of a known type). Duplicates,
    /// stale versions and unknown event types are successes.
    fn apply(
        &self,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, ProjectionError>> + Send + '_>>;

    /// Highest `updated_at` across the read model's entities.
    ///
    /// This is the reconciliation watermark. It lives in the read-model rows
    /// themselves rather than in process state, so any number of consumer
    /// instances can restart without losing it. `None` means the projection
    /// is empty and backfill starts from the beginning.
    fn watermark(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, ProjectionError>> + Send + '_>>;
}
