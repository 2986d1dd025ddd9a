//! Direct read access to the owning service, for reconciliation.
//!
//! When a consumer has missed events (broker downtime, first boot, repaired
//! corruption) it catches up by querying the auction service's read endpoint
//! directly: "give me every auction modified at or after my watermark". The
//! endpoint returns full snapshots sorted by the watermark field; an empty
//! page means the caller is caught up.

use crate::event::{AuctionCreated, AuctionEvent, EventEnvelope, EventError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the source read endpoint.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The endpoint could not be reached; retry with backoff.
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    /// The endpoint answered with something that is not a snapshot page.
    #[error("Source response malformed: {0}")]
    Malformed(String),
}

/// A full auction record as served by the owning service.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    /// Auction identifier.
    pub id: Uuid,
    /// Monotonic modification counter of the record.
    pub version: i64,
    /// Seller username.
    pub seller: String,
    /// Winner username, once finished.
    pub winner: Option<String>,
    /// Reserve price.
    pub reserve_price: i64,
    /// Final sale amount, once finished.
    pub sold_amount: Option<i64>,
    /// Highest accepted bid so far.
    pub current_high_bid: Option<i64>,
    /// When bidding closes.
    pub auction_end: DateTime<Utc>,
    /// Lifecycle status.
    pub status: String,
    /// Item make.
    pub make: String,
    /// Item model.
    pub model: String,
    /// Item model year.
    pub year: i32,
    /// Item color.
    pub color: String,
    /// Item mileage.
    pub mileage: i32,
    /// Item image URL.
    pub image_url: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last modified; the watermark field.
    pub updated_at: DateTime<Utc>,
}

impl AuctionSnapshot {
    /// Replay this snapshot as a created-event through the idempotent apply
    /// path.
    ///
    /// The message id is derived deterministically from the aggregate id and
    /// version (UUIDv5), so backfilling the same record twice deduplicates in
    /// the inbox exactly like a broker redelivery would.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the snapshot cannot be
    /// encoded (practically unreachable).
    pub fn to_envelope(&self) -> Result<EventEnvelope, EventError> {
        let event = AuctionEvent::Created(AuctionCreated {
            id: self.id,
            seller: self.seller.clone(),
            winner: self.winner.clone(),
            reserve_price: self.reserve_price,
            sold_amount: self.sold_amount,
            current_high_bid: self.current_high_bid,
            auction_end: self.auction_end,
            status: self.status.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year,
            color: self.color.clone(),
            mileage: self.mileage,
            image_url: self.image_url.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        });

        let name = format!("marketsync:backfill:{}:{}", self.id, self.version);
        Ok(EventEnvelope {
            message_id: Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()),
            event_type: event.event_type().to_string(),
            aggregate_id: self.id,
            version: self.version,
            payload: event.to_payload()?,
        })
    }
}

/// Client for the owning service's watermark query endpoint.
pub trait SourceReader: Send + Sync {
    /// Fetch every auction modified at or after `watermark`, sorted ascending
    /// by modification time. `None` asks for everything.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unreachable`] on network failure (the caller
    /// retries indefinitely; the projection is allowed to stay stale) and
    /// [`SourceError::Malformed`] if the response does not parse.
    fn fetch_since(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuctionSnapshot>, SourceError>> + Send + '_>>;
}
