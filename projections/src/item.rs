//! The denormalized search document and its fold rules.
//!
//! The fold rules here are the single place that defines how an event
//! mutates a document and when it is too old to matter. The in-memory test
//! projection applies them directly; the `PostgreSQL` projector encodes the
//! same guards in SQL (`last_applied_version < incoming` and the
//! high-bid maximum) so both agree on out-of-order behavior.

use chrono::{DateTime, Utc};
use marketsync_core::event::{AuctionCreated, AuctionFinished, AuctionUpdated, BidPlaced};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A search document: the subset of an auction the marketplace queries on,
/// plus the bookkeeping fields that make applying events safe to repeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SearchItem {
    /// Auction identifier.
    pub id: Uuid,
    /// Seller username.
    pub seller: String,
    /// Winner username, once finished.
    pub winner: Option<String>,
    /// Reserve price.
    pub reserve_price: i64,
    /// Final sale amount, once finished.
    pub sold_amount: Option<i64>,
    /// Highest accepted bid seen so far.
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
    /// When the auction record was created.
    pub created_at: DateTime<Utc>,
    /// Authoritative last-modified time; the reconciliation watermark.
    pub updated_at: DateTime<Utc>,
    /// Version of the last applied auction-service event; the ordering guard.
    pub last_applied_version: i64,
}

impl SearchItem {
    /// Build a document from a created-event (or a backfilled snapshot
    /// replayed as one).
    #[must_use]
    pub fn from_created(event: &AuctionCreated, version: i64) -> Self {
        Self {
            id: event.id,
            seller: event.seller.clone(),
            winner: event.winner.clone(),
            reserve_price: event.reserve_price,
            sold_amount: event.sold_amount,
            current_high_bid: event.current_high_bid,
            auction_end: event.auction_end,
            status: event.status.clone(),
            make: event.make.clone(),
            model: event.model.clone(),
            year: event.year,
            color: event.color.clone(),
            mileage: event.mileage,
            image_url: event.image_url.clone(),
            created_at: event.created_at,
            updated_at: event.updated_at,
            last_applied_version: version,
        }
    }

    /// Overwrite this document from a full snapshot, if the snapshot is
    /// newer. Returns whether anything changed.
    pub fn apply_created(&mut self, event: &AuctionCreated, version: i64) -> bool {
        if version <= self.last_applied_version {
            return false;
        }
        *self = Self::from_created(event, version);
        true
    }

    /// Fold in a partial item update, if it is newer. Returns whether
    /// anything changed.
    pub fn apply_updated(&mut self, event: &AuctionUpdated, version: i64) -> bool {
        if version <= self.last_applied_version {
            return false;
        }
        if let Some(make) = &event.make {
            self.make.clone_from(make);
        }
        if let Some(model) = &event.model {
            self.model.clone_from(model);
        }
        if let Some(year) = event.year {
            self.year = year;
        }
        if let Some(color) = &event.color {
            self.color.clone_from(color);
        }
        if let Some(mileage) = event.mileage {
            self.mileage = mileage;
        }
        self.updated_at = event.updated_at;
        self.last_applied_version = version;
        true
    }

    /// Record the auction's close, if it is newer. The status depends on
    /// whether the winning bid met the reserve.
    pub fn apply_finished(&mut self, event: &AuctionFinished, version: i64) -> bool {
        if version <= self.last_applied_version {
            return false;
        }
        self.winner = event.winner.clone();
        self.sold_amount = event.amount;
        self.status = if event.item_sold {
            "Finished".to_string()
        } else {
            "ReserveNotMet".to_string()
        };
        self.last_applied_version = version;
        true
    }

    /// Track the running high bid. Taking the maximum is commutative, so
    /// this needs no version guard and redeliveries in any order converge.
    /// Returns whether the high bid moved.
    pub fn apply_bid(&mut self, event: &BidPlaced) -> bool {
        if !event.bid_status.contains("Accepted") {
            return false;
        }
        if self.current_high_bid.is_some_and(|high| high >= event.amount) {
            return false;
        }
        self.current_high_bid = Some(event.amount);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn created(version: i64, color: &str) -> (AuctionCreated, i64) {
        (
            AuctionCreated {
                id: Uuid::nil(),
                seller: "alice".to_string(),
                winner: None,
                reserve_price: 50_000,
                sold_amount: None,
                current_high_bid: None,
                auction_end: Utc::now(),
                status: "Live".to_string(),
                make: "Ford".to_string(),
                model: "Mustang".to_string(),
                year: 1967,
                color: color.to_string(),
                mileage: 80_000,
                image_url: "https://example.com/mustang.jpg".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            version,
        )
    }

    #[test]
    fn update_with_older_version_is_dropped() {
        let (event, version) = created(1, "Red");
        let mut item = SearchItem::from_created(&event, version);

        let newer = AuctionUpdated {
            id: item.id,
            make: None,
            model: None,
            year: None,
            color: Some("Black".to_string()),
            mileage: None,
            updated_at: Utc::now(),
        };
        assert!(item.apply_updated(&newer, 5));
        assert_eq!(item.color, "Black");

        // A redelivered version-3 update must not regress the document.
        let stale = AuctionUpdated {
            id: item.id,
            make: None,
            model: None,
            year: None,
            color: Some("Green".to_string()),
            mileage: None,
            updated_at: Utc::now(),
        };
        assert!(!item.apply_updated(&stale, 3));
        assert_eq!(item.color, "Black");
        assert_eq!(item.last_applied_version, 5);
    }

    #[test]
    fn partial_update_keeps_absent_fields() {
        let (event, version) = created(1, "Red");
        let mut item = SearchItem::from_created(&event, version);

        let update = AuctionUpdated {
            id: item.id,
            make: None,
            model: None,
            year: Some(1968),
            color: None,
            mileage: None,
            updated_at: Utc::now(),
        };
        assert!(item.apply_updated(&update, 2));

        assert_eq!(item.year, 1968);
        assert_eq!(item.make, "Ford");
        assert_eq!(item.color, "Red");
    }

    #[test]
    fn stale_snapshot_does_not_overwrite() {
        let (event, _) = created(1, "Red");
        let mut item = SearchItem::from_created(&event, 4);

        let (older, _) = created(1, "Yellow");
        assert!(!item.apply_created(&older, 2));
        assert_eq!(item.color, "Red");
    }

    #[test]
    fn finished_sets_terminal_status_from_reserve() {
        let (event, version) = created(1, "Red");
        let mut item = SearchItem::from_created(&event, version);

        let finished = AuctionFinished {
            item_sold: true,
            auction_id: item.id,
            winner: Some("bob".to_string()),
            seller: "alice".to_string(),
            amount: Some(60_000),
        };
        assert!(item.apply_finished(&finished, 2));
        assert_eq!(item.status, "Finished");
        assert_eq!(item.winner.as_deref(), Some("bob"));
        assert_eq!(item.sold_amount, Some(60_000));
    }

    #[test]
    fn unsold_auction_reports_reserve_not_met() {
        let (event, version) = created(1, "Red");
        let mut item = SearchItem::from_created(&event, version);

        let finished = AuctionFinished {
            item_sold: false,
            auction_id: item.id,
            winner: None,
            seller: "alice".to_string(),
            amount: None,
        };
        assert!(item.apply_finished(&finished, 2));
        assert_eq!(item.status, "ReserveNotMet");
        assert!(item.winner.is_none());
    }

    #[test]
    fn high_bid_is_a_running_maximum() {
        let (event, version) = created(1, "Red");
        let mut item = SearchItem::from_created(&event, version);
        let auction_id = item.id;

        let bid = move |amount: i64, status: &str| BidPlaced {
            id: Uuid::new_v4(),
            auction_id,
            bidder: "bob".to_string(),
            amount,
            bid_time: Utc::now(),
            bid_status: status.to_string(),
        };

        assert!(item.apply_bid(&bid(55_000, "Accepted")));
        // A lower accepted bid arriving late does not regress the maximum.
        assert!(!item.apply_bid(&bid(52_000, "Accepted")));
        assert_eq!(item.current_high_bid, Some(55_000));

        // Rejected bids never move the high bid.
        assert!(!item.apply_bid(&bid(70_000, "TooLow")));
        assert_eq!(item.current_high_bid, Some(55_000));

        assert!(item.apply_bid(&bid(61_000, "AcceptedBelowReserve")));
        assert_eq!(item.current_high_bid, Some(61_000));
    }
}
