//! In-memory outbox store with explicit transactions.
//!
//! [`MemoryOutboxStore`] models the properties the `PostgreSQL` store gets
//! from its database: appends only become visible on commit, claims carry a
//! lease, and `mark_sent` is an idempotent one-way transition. The
//! `set_mark_sent_failures` switch simulates a dispatcher crashing between
//! broker acknowledgement and mark-sent, which is how the at-least-once
//! property is exercised without killing a process.

use chrono::Utc;
use marketsync_core::event::EventEnvelope;
use marketsync_core::outbox::{OutboxError, OutboxMessage, OutboxStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

struct Row {
    message: OutboxMessage,
    claimed_until: Option<Instant>,
}

#[derive(Default)]
struct Shared {
    rows: Vec<Row>,
}

/// In-memory stand-in for the `PostgreSQL` outbox store.
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    shared: Arc<Mutex<Shared>>,
    fail_mark_sent: Arc<AtomicBool>,
}

impl MemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction; appends are invisible until [`MemoryOutboxTransaction::commit`].
    #[must_use]
    pub fn begin(&self) -> MemoryOutboxTransaction {
        MemoryOutboxTransaction {
            shared: Arc::clone(&self.shared),
            staged: Vec::new(),
        }
    }

    /// Make every `mark_sent` call fail while `fail` is set.
    pub fn set_mark_sent_failures(&self, fail: bool) {
        self.fail_mark_sent.store(fail, Ordering::SeqCst);
    }

    /// Number of rows the broker has never acknowledged.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn unsent_count(&self) -> usize {
        let shared = self.shared.lock().expect("lock poisoned");
        shared
            .rows
            .iter()
            .filter(|r| r.message.sent_at.is_none())
            .count()
    }

    /// All row ids currently in the store, in append order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn ids(&self) -> Vec<Uuid> {
        let shared = self.shared.lock().expect("lock poisoned");
        shared.rows.iter().map(|r| r.message.id).collect()
    }
}

/// A buffered unit of work against [`MemoryOutboxStore`].
pub struct MemoryOutboxTransaction {
    shared: Arc<Mutex<Shared>>,
    staged: Vec<OutboxMessage>,
}

impl MemoryOutboxTransaction {
    /// Stage a scheduled publication; visible only after commit.
    pub fn append(&mut self, envelope: &EventEnvelope) -> OutboxMessage {
        let message = OutboxMessage {
            id: envelope.message_id,
            aggregate_id: envelope.aggregate_id,
            event_type: envelope.event_type.clone(),
            version: envelope.version,
            payload: envelope.payload.clone(),
            created_at: Utc::now(),
            sent_at: None,
        };
        self.staged.push(message.clone());
        message
    }

    /// Publish the staged rows to the store.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::expect_used)]
    pub fn commit(self) {
        let mut shared = self.shared.lock().expect("lock poisoned");
        for message in self.staged {
            shared.rows.push(Row {
                message,
                claimed_until: None,
            });
        }
    }

    /// Discard the staged rows, as a rolled-back database transaction would.
    pub fn rollback(self) {
        drop(self.staged);
    }
}

impl OutboxStore for MemoryOutboxStore {
    fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut shared = self
                .shared
                .lock()
                .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;

            let mut claimed = Vec::new();
            for row in &mut shared.rows {
                if claimed.len() >= limit {
                    break;
                }
                let leased = row.claimed_until.is_some_and(|until| until > now);
                if row.message.sent_at.is_none() && !leased {
                    row.claimed_until = Some(now + lease);
                    claimed.push(row.message.clone());
                }
            }

            claimed.sort_by_key(|m| m.created_at);
            Ok(claimed)
        })
    }

    fn mark_sent(
        &self,
        ids: &[Uuid],
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            if self.fail_mark_sent.load(Ordering::SeqCst) {
                return Err(OutboxError::Storage("simulated mark_sent failure".to_string()));
            }

            let mut shared = self
                .shared
                .lock()
                .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;

            for row in &mut shared.rows {
                if ids.contains(&row.message.id) && row.message.sent_at.is_none() {
                    row.message.sent_at = Some(Utc::now());
                    row.claimed_until = None;
                }
            }

            Ok(())
        })
    }
}
