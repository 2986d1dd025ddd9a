//! Domain events and the wire envelope they travel in.
//!
//! Events represent facts about auctions that have already happened. They are
//! immutable, carry a monotonic per-aggregate `version`, and cross service
//! boundaries as JSON so consumers built against an older event catalogue can
//! skip kinds they do not know about instead of failing.
//!
//! # Event Catalogue
//!
//! | type | produced by | carried data |
//! |------|-------------|--------------|
//! | `AuctionCreated` | auction service | full auction snapshot |
//! | `AuctionUpdated` | auction service | changed item fields only |
//! | `AuctionDeleted` | auction service | auction id |
//! | `AuctionFinished` | bidding service | winner, sale amount |
//! | `BidPlaced` | bidding service | bidder, amount, bid status |
//!
//! # Example
//!
//! ```
//! use marketsync_core::event::{AuctionEvent, AuctionDeleted, EventEnvelope};
//! use uuid::Uuid;
//!
//! let event = AuctionEvent::Deleted(AuctionDeleted { id: Uuid::new_v4() });
//! let envelope = EventEnvelope::new(&event, 7).expect("serializable");
//! assert_eq!(envelope.event_type, "AuctionDeleted");
//!
//! // Consumers decode back to the typed catalogue; unknown types yield None.
//! let decoded = AuctionEvent::from_envelope(&envelope).expect("well-formed payload");
//! assert!(decoded.is_some());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding and decoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an event payload to JSON.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// A payload claimed a known event type but did not match its schema.
    #[error("Failed to deserialize event: {0}")]
    Deserialization(String),
}

/// Full auction snapshot published when an auction is listed.
///
/// Also the shape used by the reconciliation path: a backfilled record is
/// replayed as a created-event with the record's own version stamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionCreated {
    /// Auction identifier (aggregate id).
    pub id: Uuid,
    /// Username of the seller.
    pub seller: String,
    /// Username of the winner, once the auction has finished.
    pub winner: Option<String>,
    /// Minimum price the seller will accept.
    pub reserve_price: i64,
    /// Final sale amount, once the auction has finished.
    pub sold_amount: Option<i64>,
    /// Highest accepted bid so far.
    pub current_high_bid: Option<i64>,
    /// When bidding closes.
    pub auction_end: DateTime<Utc>,
    /// Lifecycle status (`Live`, `Finished`, `ReserveNotMet`).
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
    /// When the auction record was created.
    pub created_at: DateTime<Utc>,
    /// When the auction record was last modified.
    pub updated_at: DateTime<Utc>,
}

/// Partial item update; only the present fields change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionUpdated {
    /// Auction identifier (aggregate id).
    pub id: Uuid,
    /// New make, if changed.
    pub make: Option<String>,
    /// New model, if changed.
    pub model: Option<String>,
    /// New model year, if changed.
    pub year: Option<i32>,
    /// New color, if changed.
    pub color: Option<String>,
    /// New mileage, if changed.
    pub mileage: Option<i32>,
    /// When the auction record was last modified.
    pub updated_at: DateTime<Utc>,
}

/// Auction removed by its seller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionDeleted {
    /// Auction identifier (aggregate id).
    pub id: Uuid,
}

/// Auction closed by the bidding service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionFinished {
    /// Whether the item sold (reserve met by the winning bid).
    pub item_sold: bool,
    /// Auction identifier (aggregate id).
    pub auction_id: Uuid,
    /// Winning bidder, when the item sold.
    pub winner: Option<String>,
    /// Seller username.
    pub seller: String,
    /// Winning amount, when the item sold.
    pub amount: Option<i64>,
}

/// A bid accepted or rejected by the bidding service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPlaced {
    /// Bid identifier.
    pub id: Uuid,
    /// Auction identifier (aggregate id).
    pub auction_id: Uuid,
    /// Bidder username.
    pub bidder: String,
    /// Bid amount.
    pub amount: i64,
    /// When the bid was placed.
    pub bid_time: DateTime<Utc>,
    /// Bid outcome (`Accepted`, `AcceptedBelowReserve`, `TooLow`, `Finished`).
    pub bid_status: String,
}

/// Tagged union over the known event kinds.
///
/// Dispatch on event type is closed over this enum; payloads whose type is
/// not in the catalogue decode to `None` in [`AuctionEvent::from_envelope`]
/// and must be treated as a no-op by consumers, which is what allows new
/// event kinds to be added without breaking deployed consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum AuctionEvent {
    /// A new auction was listed.
    Created(AuctionCreated),
    /// Item fields changed on a live auction.
    Updated(AuctionUpdated),
    /// An auction was removed.
    Deleted(AuctionDeleted),
    /// An auction was closed.
    Finished(AuctionFinished),
    /// A bid was placed.
    BidPlaced(BidPlaced),
}

impl AuctionEvent {
    /// Stable wire identifier for this event kind.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "AuctionCreated",
            Self::Updated(_) => "AuctionUpdated",
            Self::Deleted(_) => "AuctionDeleted",
            Self::Finished(_) => "AuctionFinished",
            Self::BidPlaced(_) => "BidPlaced",
        }
    }

    /// Identifier of the auction this event belongs to.
    #[must_use]
    pub const fn aggregate_id(&self) -> Uuid {
        match self {
            Self::Created(e) => e.id,
            Self::Updated(e) => e.id,
            Self::Deleted(e) => e.id,
            Self::Finished(e) => e.auction_id,
            Self::BidPlaced(e) => e.auction_id,
        }
    }

    /// Serialize the payload of this event to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be
    /// represented as JSON (practically unreachable for these types).
    pub fn to_payload(&self) -> Result<Value, EventError> {
        let encoded = match self {
            Self::Created(e) => serde_json::to_value(e),
            Self::Updated(e) => serde_json::to_value(e),
            Self::Deleted(e) => serde_json::to_value(e),
            Self::Finished(e) => serde_json::to_value(e),
            Self::BidPlaced(e) => serde_json::to_value(e),
        };
        encoded.map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Decode an envelope back into the typed catalogue.
    ///
    /// Returns `Ok(None)` for event types outside the catalogue; the
    /// caller must treat that as "nothing to do", never as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] when the envelope names a
    /// known event type but carries a payload that does not match it. That
    /// is a malformed message, and the caller's retry/dead-letter policy
    /// applies.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Option<Self>, EventError> {
        let event = match envelope.event_type.as_str() {
            "AuctionCreated" => Self::Created(decode(&envelope.payload)?),
            "AuctionUpdated" => Self::Updated(decode(&envelope.payload)?),
            "AuctionDeleted" => Self::Deleted(decode(&envelope.payload)?),
            "AuctionFinished" => Self::Finished(decode(&envelope.payload)?),
            "BidPlaced" => Self::BidPlaced(decode(&envelope.payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, EventError> {
    serde_json::from_value(payload.clone()).map_err(|e| EventError::Deserialization(e.to_string()))
}

/// The unit that actually crosses the broker.
///
/// `message_id` identifies one publication for consumer-side deduplication;
/// `version` is the aggregate's monotonic modification counter, used by
/// read models to drop stale redeliveries regardless of arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique identity of this message, stable across redeliveries.
    pub message_id: Uuid,
    /// Wire identifier of the event kind.
    pub event_type: String,
    /// Identifier of the auction this event belongs to.
    pub aggregate_id: Uuid,
    /// Monotonic per-aggregate modification counter.
    pub version: i64,
    /// Type-specific JSON payload.
    pub payload: Value,
}

impl EventEnvelope {
    /// Wrap an event for publication, assigning a fresh message id.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be
    /// serialized.
    pub fn new(event: &AuctionEvent, version: i64) -> Result<Self, EventError> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            version,
            payload: event.to_payload()?,
        })
    }

    /// Serialize the envelope for the broker.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] on encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope received from the broker.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the bytes are not a
    /// well-formed envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn created_event() -> AuctionEvent {
        AuctionEvent::Created(AuctionCreated {
            id: Uuid::new_v4(),
            seller: "alice".to_string(),
            winner: None,
            reserve_price: 20_000,
            sold_amount: None,
            current_high_bid: None,
            auction_end: Utc::now(),
            status: "Live".to_string(),
            make: "Ford".to_string(),
            model: "GT".to_string(),
            year: 2020,
            color: "White".to_string(),
            mileage: 50_000,
            image_url: "https://example.com/gt.jpg".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn envelope_roundtrip() {
        let event = created_event();
        let envelope = EventEnvelope::new(&event, 1).unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let decoded = EventEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(envelope, decoded);
        assert_eq!(decoded.event_type, "AuctionCreated");
        assert_eq!(decoded.aggregate_id, event.aggregate_id());
    }

    #[test]
    fn typed_decode_roundtrip() {
        let event = created_event();
        let envelope = EventEnvelope::new(&event, 1).unwrap();

        let decoded = AuctionEvent::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, Some(event));
    }

    #[test]
    fn unknown_event_type_is_none_not_error() {
        let envelope = EventEnvelope {
            message_id: Uuid::new_v4(),
            event_type: "AuctionRelisted".to_string(),
            aggregate_id: Uuid::new_v4(),
            version: 3,
            payload: serde_json::json!({ "anything": true }),
        };

        let decoded = AuctionEvent::from_envelope(&envelope).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn known_type_with_bad_payload_is_error() {
        let envelope = EventEnvelope {
            message_id: Uuid::new_v4(),
            event_type: "AuctionDeleted".to_string(),
            aggregate_id: Uuid::new_v4(),
            version: 3,
            payload: serde_json::json!({ "id": "not-a-uuid" }),
        };

        assert!(AuctionEvent::from_envelope(&envelope).is_err());
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let event = AuctionEvent::Deleted(AuctionDeleted { id: Uuid::new_v4() });
        let envelope = EventEnvelope::new(&event, 2).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert!(json.get("messageId").is_some());
        assert!(json.get("eventType").is_some());
        assert!(json.get("aggregateId").is_some());
    }
}
