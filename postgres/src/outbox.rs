//! `PostgreSQL`-backed outbox store.
//!
//! Rows are appended inside the caller's transaction and drained by the
//! dispatcher through a lease-based claim: a conditional update stamps
//! `claimed_until` on unsent, unleased rows under `FOR UPDATE SKIP LOCKED`,
//! so concurrent dispatcher instances never hold the same row at the same
//! time and a crashed instance's claims simply expire.

use chrono::{DateTime, Utc};
use marketsync_core::event::EventEnvelope;
use marketsync_core::outbox::{OutboxError, OutboxMessage, OutboxStore};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Row mapping for `outbox_messages`.
#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_id: Uuid,
    event_type: String,
    version: i64,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            version: row.version,
            payload: row.payload,
            created_at: row.created_at,
            sent_at: row.sent_at,
        }
    }
}

/// Outbox store colocated with the auction service's database.
///
/// # Example
///
/// ```ignore
/// use marketsync_postgres::PgOutboxStore;
///
/// let store = PgOutboxStore::connect("postgres://localhost/auctions").await?;
/// store.migrate().await?;
///
/// // Inside the aggregate's transaction:
/// let mut tx = store.pool().begin().await?;
/// // ... mutate auction tables ...
/// PgOutboxStore::append(&mut tx, &envelope).await?;
/// tx.commit().await?;
/// ```
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool and wrap it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| OutboxError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Run the outbox migrations.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    ///
    /// The aggregate-writing code opens its transactions here so outbox
    /// appends share them.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append a scheduled publication inside the caller's transaction.
    ///
    /// If the surrounding transaction rolls back, the row rolls back with
    /// it; the envelope's `message_id` becomes the row id so a later
    /// republication keeps the same identity.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the insert fails.
    pub async fn append(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<OutboxMessage, OutboxError> {
        let row: OutboxRow = sqlx::query_as(
            r"
            INSERT INTO outbox_messages (id, aggregate_id, event_type, version, payload)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, aggregate_id, event_type, version, payload, created_at, sent_at
            ",
        )
        .bind(envelope.message_id)
        .bind(envelope.aggregate_id)
        .bind(&envelope.event_type)
        .bind(envelope.version)
        .bind(&envelope.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| OutboxError::Storage(format!("Failed to append: {e}")))?;

        metrics::counter!("outbox.appended", "event_type" => envelope.event_type.clone())
            .increment(1);

        Ok(row.into())
    }

    /// Count rows the broker has never acknowledged.
    ///
    /// Useful for monitoring and health checks.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the query fails.
    pub async fn unsent_count(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_messages WHERE sent_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| OutboxError::Storage(format!("Failed to count unsent: {e}")))?;

        Ok(count)
    }

    /// Delete sent rows older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the delete fails.
    pub async fn prune_sent(&self, retention: Duration) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r"
            DELETE FROM outbox_messages
            WHERE sent_at IS NOT NULL
              AND sent_at < now() - make_interval(secs => $1)
            ",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(format!("Failed to prune: {e}")))?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned sent outbox rows");
        }

        Ok(pruned)
    }
}

impl OutboxStore for PgOutboxStore {
    fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are small
            let limit_i64 = limit as i64;

            // The inner select orders and locks; the outer update stamps the
            // lease. RETURNING gives no ordering guarantee, so rows are
            // re-sorted before handing them to the dispatcher.
            let rows: Vec<OutboxRow> = sqlx::query_as(
                r"
                UPDATE outbox_messages
                SET claimed_until = now() + make_interval(secs => $2)
                WHERE id IN (
                    SELECT id FROM outbox_messages
                    WHERE sent_at IS NULL
                      AND (claimed_until IS NULL OR claimed_until < now())
                    ORDER BY created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, aggregate_id, event_type, version, payload, created_at, sent_at
                ",
            )
            .bind(limit_i64)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("Failed to claim batch: {e}")))?;

            let mut messages: Vec<OutboxMessage> = rows.into_iter().map(Into::into).collect();
            messages.sort_by_key(|m| m.created_at);

            if !messages.is_empty() {
                tracing::debug!(claimed = messages.len(), "Claimed outbox batch");
                metrics::counter!("outbox.claimed").increment(messages.len() as u64);
            }

            Ok(messages)
        })
    }

    fn mark_sent(
        &self,
        ids: &[Uuid],
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }

            // The sent_at IS NULL filter makes this a no-op for rows already
            // marked, so replays after a dispatcher crash are harmless.
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET sent_at = now(), claimed_until = NULL
                WHERE id = ANY($1) AND sent_at IS NULL
                ",
            )
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("Failed to mark sent: {e}")))?;

            metrics::counter!("outbox.marked_sent").increment(result.rows_affected());

            Ok(())
        })
    }
}
