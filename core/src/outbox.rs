//! Transactional outbox contract.
//!
//! An [`OutboxMessage`] is written in the same storage transaction as the
//! aggregate change it describes. If that transaction rolls back, the message
//! rolls back with it, which is what closes the "state saved, event lost" and
//! "event sent, state not saved" windows without two-phase commit.
//!
//! The append operation is storage-specific (it must join the caller's
//! transaction) and therefore lives on the concrete store. This module defines
//! the dispatcher-facing half: claiming unsent rows under a lease and marking
//! them sent after the broker acknowledged them.

use crate::event::EventEnvelope;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by outbox storage.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Underlying storage failed (connection, timeout, constraint).
    #[error("Outbox storage error: {0}")]
    Storage(String),

    /// The event payload could not be encoded for storage.
    #[error("Outbox serialization error: {0}")]
    Serialization(String),
}

/// One scheduled publication, colocated with the aggregate's storage.
///
/// `sent_at` is the only state transition the row ever makes: `None` means
/// the broker has never acknowledged this message; once set it is never
/// cleared. Rows are pruned after a retention window, not updated.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxMessage {
    /// Message identity; becomes the envelope's `message_id` on the wire.
    pub id: Uuid,
    /// Auction this message belongs to.
    pub aggregate_id: Uuid,
    /// Wire identifier of the event kind.
    pub event_type: String,
    /// Monotonic per-aggregate modification counter.
    pub version: i64,
    /// Type-specific JSON payload.
    pub payload: Value,
    /// When the row was appended.
    pub created_at: DateTime<Utc>,
    /// When the broker acknowledged the publication, if it has.
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Build the wire envelope for this row.
    ///
    /// The outbox row id doubles as the message id, so a message republished
    /// after a crash carries the same identity and deduplicates downstream.
    #[must_use]
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            message_id: self.id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id,
            version: self.version,
            payload: self.payload.clone(),
        }
    }
}

/// Dispatcher-facing outbox operations.
///
/// Implementations must make `claim_batch` safe for concurrent callers: a row
/// may be held by at most one claimer per lease window, and a claimer that
/// crashes simply lets the lease lapse: the row is unsent and will be picked
/// up again. `mark_sent` must be idempotent; marking an already-sent id is a
/// no-op.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the store can be held as
/// `Arc<dyn OutboxStore>` by the dispatcher.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` unsent rows for `lease`, oldest first.
    ///
    /// Ordering is FIFO per store; no ordering is promised across aggregates
    /// beyond that.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the claim query fails.
    fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>>;

    /// Record broker acknowledgement for the given rows.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the update fails; in that case the
    /// rows stay unsent and will be republished, which consumers absorb.
    fn mark_sent(
        &self,
        ids: &[Uuid],
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;
}
