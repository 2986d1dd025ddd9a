//! Fixture source reader for reconciliation tests.

use chrono::{DateTime, Utc};
use marketsync_core::source::{AuctionSnapshot, SourceError, SourceReader};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A source reader serving a fixed set of snapshots.
///
/// Honors the watermark contract of the real endpoint: returns records
/// modified at or after the watermark, sorted by modification time. Can be
/// told to fail its next N fetches to exercise the retry-forever policy.
#[derive(Default)]
pub struct FixedSourceReader {
    records: Mutex<Vec<AuctionSnapshot>>,
    transient_failures: AtomicUsize,
}

impl FixedSourceReader {
    /// Create a reader over the given records.
    #[must_use]
    pub fn new(records: Vec<AuctionSnapshot>) -> Self {
        Self {
            records: Mutex::new(records),
            transient_failures: AtomicUsize::new(0),
        }
    }

    /// Add a record, as if the owning service took another write.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::expect_used)]
    pub fn push(&self, snapshot: AuctionSnapshot) {
        self.records.lock().expect("lock poisoned").push(snapshot);
    }

    /// Fail the next `count` fetches with a network error.
    pub fn set_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }
}

impl SourceReader for FixedSourceReader {
    fn fetch_since(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuctionSnapshot>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let failing = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SourceError::Unreachable(
                    "simulated network failure".to_string(),
                ));
            }

            let records = self
                .records
                .lock()
                .map_err(|_| SourceError::Unreachable("lock poisoned".to_string()))?;

            let mut page: Vec<AuctionSnapshot> = records
                .iter()
                .filter(|s| watermark.is_none_or(|w| s.updated_at >= w))
                .cloned()
                .collect();
            page.sort_by_key(|s| s.updated_at);

            Ok(page)
        })
    }
}
