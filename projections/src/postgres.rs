//! `PostgreSQL`-backed search projection with an inbox guard.
//!
//! [`PgSearchProjection`] is the consumer side of the pipeline: one local
//! transaction covers the inbox insert and the document mutation, so either
//! both land or neither does. Deduplication rides on the
//! `(message_id, consumer_name)` primary key (two racing deliveries of the
//! same message cannot both insert) and ordering rides on the
//! `last_applied_version` compare built into every mutation statement.

use chrono::{DateTime, Utc};
use marketsync_core::apply::{ApplyOutcome, EventApplier, ProjectionError};
use marketsync_core::event::{AuctionEvent, EventEnvelope};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

use crate::item::SearchItem;

/// The marketplace search projection over `PostgreSQL`.
///
/// # Example
///
/// ```ignore
/// use marketsync_projections::PgSearchProjection;
/// use marketsync_core::apply::EventApplier;
///
/// let projection = PgSearchProjection::connect(
///     "postgres://localhost/search",
///     "search-projection",
/// ).await?;
/// projection.migrate().await?;
///
/// let outcome = projection.apply(&envelope).await?;
/// ```
#[derive(Clone)]
pub struct PgSearchProjection {
    pool: PgPool,
    consumer_name: String,
}

impl PgSearchProjection {
    /// Create a projection over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool, consumer_name: impl Into<String>) -> Self {
        Self {
            pool,
            consumer_name: consumer_name.into(),
        }
    }

    /// Connect a new pool and wrap it.
    ///
    /// The projection usually lives in a different database than the auction
    /// service's, which is the point: it only ever talks to the source
    /// through the bus or the read endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        consumer_name: impl Into<String>,
    ) -> Result<Self, ProjectionError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool, consumer_name))
    }

    /// Run the search projection migrations.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<(), ProjectionError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch one document by auction id.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the query fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<SearchItem>, ProjectionError> {
        sqlx::query_as::<_, SearchItem>("SELECT * FROM search_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to get item: {e}")))
    }

    /// List a seller's auctions, most recently modified first.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the query fails.
    pub async fn list_by_seller(&self, seller: &str) -> Result<Vec<SearchItem>, ProjectionError> {
        sqlx::query_as::<_, SearchItem>(
            "SELECT * FROM search_items
             WHERE seller = $1
             ORDER BY updated_at DESC
             LIMIT 100",
        )
        .bind(seller)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to list by seller: {e}")))
    }

    /// Free-text search over make, model and color.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the query fails.
    pub async fn search(&self, term: &str) -> Result<Vec<SearchItem>, ProjectionError> {
        let pattern = format!("%{term}%");
        sqlx::query_as::<_, SearchItem>(
            "SELECT * FROM search_items
             WHERE make ILIKE $1 OR model ILIKE $1 OR color ILIKE $1
             ORDER BY auction_end ASC
             LIMIT 100",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to search: {e}")))
    }

    /// Drop inbox rows older than the retention window.
    ///
    /// Safe once the broker can no longer redeliver messages that old.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the delete fails.
    pub async fn prune_inbox(&self, retention: Duration) -> Result<u64, ProjectionError> {
        let result = sqlx::query(
            r"
            DELETE FROM inbox_records
            WHERE consumer_name = $1
              AND received_at < now() - make_interval(secs => $2)
            ",
        )
        .bind(&self.consumer_name)
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to prune inbox: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn mutate(
        tx: &mut Transaction<'_, Postgres>,
        event: &AuctionEvent,
        version: i64,
    ) -> Result<ApplyOutcome, ProjectionError> {
        let outcome = match event {
            AuctionEvent::Created(e) => {
                // A full snapshot either creates the document or replaces an
                // older one; the WHERE clause turns stale replays into no-ops.
                let result = sqlx::query(
                    r"
                    INSERT INTO search_items (
                        id, seller, winner, reserve_price, sold_amount, current_high_bid,
                        auction_end, status, make, model, year, color, mileage, image_url,
                        created_at, updated_at, last_applied_version
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                    ON CONFLICT (id) DO UPDATE SET
                        seller = EXCLUDED.seller,
                        winner = EXCLUDED.winner,
                        reserve_price = EXCLUDED.reserve_price,
                        sold_amount = EXCLUDED.sold_amount,
                        current_high_bid = EXCLUDED.current_high_bid,
                        auction_end = EXCLUDED.auction_end,
                        status = EXCLUDED.status,
                        make = EXCLUDED.make,
                        model = EXCLUDED.model,
                        year = EXCLUDED.year,
                        color = EXCLUDED.color,
                        mileage = EXCLUDED.mileage,
                        image_url = EXCLUDED.image_url,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at,
                        last_applied_version = EXCLUDED.last_applied_version
                    WHERE search_items.last_applied_version < EXCLUDED.last_applied_version
                    ",
                )
                .bind(e.id)
                .bind(&e.seller)
                .bind(&e.winner)
                .bind(e.reserve_price)
                .bind(e.sold_amount)
                .bind(e.current_high_bid)
                .bind(e.auction_end)
                .bind(&e.status)
                .bind(&e.make)
                .bind(&e.model)
                .bind(e.year)
                .bind(&e.color)
                .bind(e.mileage)
                .bind(&e.image_url)
                .bind(e.created_at)
                .bind(e.updated_at)
                .bind(version)
                .execute(&mut **tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to upsert item: {e}")))?;

                if result.rows_affected() == 0 {
                    ApplyOutcome::Stale
                } else {
                    ApplyOutcome::Applied
                }
            }
            AuctionEvent::Updated(e) => {
                let result = sqlx::query(
                    r"
                    UPDATE search_items SET
                        make = COALESCE($2, make),
                        model = COALESCE($3, model),
                        year = COALESCE($4, year),
                        color = COALESCE($5, color),
                        mileage = COALESCE($6, mileage),
                        updated_at = $7,
                        last_applied_version = $8
                    WHERE id = $1 AND last_applied_version < $8
                    ",
                )
                .bind(e.id)
                .bind(&e.make)
                .bind(&e.model)
                .bind(e.year)
                .bind(&e.color)
                .bind(e.mileage)
                .bind(e.updated_at)
                .bind(version)
                .execute(&mut **tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to update item: {e}")))?;

                if result.rows_affected() == 0 {
                    ApplyOutcome::Stale
                } else {
                    ApplyOutcome::Applied
                }
            }
            AuctionEvent::Deleted(e) => {
                // Deletes are terminal and need no version guard: deleting an
                // already-absent document is the same no-op either way.
                sqlx::query("DELETE FROM search_items WHERE id = $1")
                    .bind(e.id)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| ProjectionError::Storage(format!("Failed to delete item: {e}")))?;

                ApplyOutcome::Applied
            }
            AuctionEvent::Finished(e) => {
                let result = sqlx::query(
                    r"
                    UPDATE search_items SET
                        winner = $2,
                        sold_amount = $3,
                        status = CASE WHEN $4 THEN 'Finished' ELSE 'ReserveNotMet' END,
                        last_applied_version = $5
                    WHERE id = $1 AND last_applied_version < $5
                    ",
                )
                .bind(e.auction_id)
                .bind(&e.winner)
                .bind(e.amount)
                .bind(e.item_sold)
                .bind(version)
                .execute(&mut **tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to finish item: {e}")))?;

                if result.rows_affected() == 0 {
                    ApplyOutcome::Stale
                } else {
                    ApplyOutcome::Applied
                }
            }
            AuctionEvent::BidPlaced(e) => {
                if !e.bid_status.contains("Accepted") {
                    return Ok(ApplyOutcome::Ignored);
                }

                // Running maximum: commutative, so redelivery order is moot.
                let result = sqlx::query(
                    r"
                    UPDATE search_items SET current_high_bid = $2
                    WHERE id = $1
                      AND (current_high_bid IS NULL OR current_high_bid < $2)
                    ",
                )
                .bind(e.auction_id)
                .bind(e.amount)
                .execute(&mut **tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to apply bid: {e}")))?;

                if result.rows_affected() == 0 {
                    ApplyOutcome::Stale
                } else {
                    ApplyOutcome::Applied
                }
            }
        };

        Ok(outcome)
    }
}

impl EventApplier for PgSearchProjection {
    fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn apply(
        &self,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, ProjectionError>> + Send + '_>> {
        let envelope = envelope.clone();

        Box::pin(async move {
            // A known type with a payload that does not decode is a poison
            // message: fail before touching storage so the worker's
            // retry/dead-letter policy takes over.
            let event = AuctionEvent::from_envelope(&envelope)
                .map_err(|e| ProjectionError::Payload(e.to_string()))?;

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to begin: {e}")))?;

            let inserted = sqlx::query(
                r"
                INSERT INTO inbox_records (message_id, consumer_name)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(envelope.message_id)
            .bind(&self.consumer_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to insert inbox: {e}")))?;

            if inserted.rows_affected() == 0 {
                tx.commit()
                    .await
                    .map_err(|e| ProjectionError::Storage(format!("Failed to commit: {e}")))?;

                tracing::debug!(
                    message_id = %envelope.message_id,
                    consumer = %self.consumer_name,
                    "Duplicate delivery absorbed"
                );
                metrics::counter!("inbox.duplicate").increment(1);
                return Ok(ApplyOutcome::Duplicate);
            }

            let outcome = match &event {
                Some(event) => Self::mutate(&mut tx, event, envelope.version).await?,
                // Unknown event kind: keep the inbox record, change nothing.
                None => ApplyOutcome::Ignored,
            };

            tx.commit()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to commit: {e}")))?;

            match outcome {
                ApplyOutcome::Applied => {
                    metrics::counter!("projection.applied", "event_type" => envelope.event_type.clone())
                        .increment(1);
                }
                ApplyOutcome::Stale => {
                    tracing::debug!(
                        message_id = %envelope.message_id,
                        aggregate_id = %envelope.aggregate_id,
                        version = envelope.version,
                        "Stale event skipped"
                    );
                    metrics::counter!("projection.stale_skipped").increment(1);
                }
                ApplyOutcome::Ignored => {
                    metrics::counter!("projection.ignored").increment(1);
                }
                ApplyOutcome::Duplicate => {}
            }

            Ok(outcome)
        })
    }

    fn watermark(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, ProjectionError>> + Send + '_>>
    {
        Box::pin(async move {
            let (watermark,): (Option<DateTime<Utc>>,) =
                sqlx::query_as("SELECT MAX(updated_at) FROM search_items")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| {
                        ProjectionError::Storage(format!("Failed to read watermark: {e}"))
                    })?;

            Ok(watermark)
        })
    }
}
