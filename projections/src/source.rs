//! HTTP client for the auction service's watermark query endpoint.
//!
//! This is the reconciliation path's transport: `GET
//! {base}/api/auctions?date={watermark}` returns every auction modified at or
//! after the watermark, sorted by modification time. The synchronizer drives
//! it; this client only speaks the protocol.

use chrono::{DateTime, SecondsFormat, Utc};
use marketsync_core::source::{AuctionSnapshot, SourceError, SourceReader};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Reads auction snapshots from the owning service over HTTP.
pub struct HttpSourceReader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSourceReader {
    /// Create a reader against the given base URL (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unreachable`] if the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SourceError::Unreachable(format!("Failed to build client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl SourceReader for HttpSourceReader {
    fn fetch_since(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuctionSnapshot>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let url = format!("{}/api/auctions", self.base_url);
            let mut request = self.client.get(&url);
            if let Some(watermark) = watermark {
                request = request.query(&[(
                    "date",
                    watermark.to_rfc3339_opts(SecondsFormat::Micros, true),
                )]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SourceError::Unreachable(e.to_string()))?
                .error_for_status()
                .map_err(|e| SourceError::Unreachable(e.to_string()))?;

            let snapshots: Vec<AuctionSnapshot> = response
                .json()
                .await
                .map_err(|e| SourceError::Malformed(e.to_string()))?;

            tracing::debug!(
                url = %url,
                count = snapshots.len(),
                "Fetched snapshot page from source"
            );

            Ok(snapshots)
        })
    }
}
