//! Watermark-based reconciliation against the owning service.
//!
//! The bus is an optimization, not a correctness dependency: with the broker
//! completely gone, a consumer still converges by polling the auction
//! service's read endpoint from its current watermark and replaying the
//! returned snapshots through the same idempotent apply path the bus
//! consumer uses. Runs at startup (cold boot, post-outage catch-up) and
//! optionally on a period.

use marketsync_core::apply::{ApplyOutcome, EventApplier, ProjectionError};
use marketsync_core::event::EventError;
use marketsync_core::source::{SourceError, SourceReader};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::retry::{RetryPolicy, retry_with_backoff};

/// Errors raised during a backfill pass.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source endpoint failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The projection rejected an apply.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// A snapshot could not be re-encoded as an event.
    #[error(transparent)]
    Event(#[from] EventError),
}

/// Synchronizer configuration, host-supplied.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry policy for a failed backfill pass. Unbounded by default: the
    /// projection may stay stale indefinitely, but the process stays healthy
    /// and keeps trying.
    pub retry: RetryPolicy,
    /// Re-run period after the initial catch-up; `None` backfills once at
    /// startup only.
    pub interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::forever(Duration::from_secs(3)),
            interval: None,
        }
    }
}

/// Pulls missed state from the owning service into the projection.
pub struct Synchronizer {
    source: Arc<dyn SourceReader>,
    projection: Arc<dyn EventApplier>,
    config: SyncConfig,
}

impl Synchronizer {
    /// Create a synchronizer over the given source and projection.
    #[must_use]
    pub fn new(
        source: Arc<dyn SourceReader>,
        projection: Arc<dyn EventApplier>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            projection,
            config,
        }
    }

    /// One backfill pass; returns how many snapshots were newly applied.
    ///
    /// Pages from the projection's watermark until a page brings nothing
    /// newer. The watermark is re-read from the projection after each page;
    /// it only moves because applied rows moved it, so a failure mid-page
    /// aborts the pass without skipping anything: the next pass re-fetches
    /// from the last fully-applied point and the inbox swallows the overlap.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if fetching or applying fails; the caller's
    /// retry policy decides what happens next.
    pub async fn backfill(&self) -> Result<usize, SyncError> {
        let mut applied = 0;
        let mut watermark = self.projection.watermark().await?;

        loop {
            let page = self.source.fetch_since(watermark).await?;
            if page.is_empty() {
                break;
            }

            for snapshot in &page {
                let envelope = snapshot.to_envelope()?;
                let outcome = self.projection.apply(&envelope).await?;
                if matches!(outcome, ApplyOutcome::Applied) {
                    applied += 1;
                }
            }

            let advanced = self.projection.watermark().await?;
            if advanced <= watermark {
                // The page held only records at or behind the watermark
                // (redeliveries of the newest row); nothing left to fetch.
                break;
            }
            watermark = advanced;
        }

        if applied > 0 {
            info!(applied, "Backfill pass applied snapshots");
            metrics::counter!("sync.backfilled").increment(applied as u64);
        }

        Ok(applied)
    }

    /// Backfill until it succeeds, under the configured retry policy.
    ///
    /// # Errors
    ///
    /// Only a bounded retry policy can make this return an error.
    pub async fn converge(&self) -> Result<usize, SyncError> {
        retry_with_backoff(self.config.retry.clone(), || self.backfill()).await
    }

    /// Spawn the synchronizer as a background task: one catch-up pass now,
    /// then periodic passes if an interval is configured.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Reconciliation synchronizer started");

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Synchronizer received shutdown signal");
                return;
            }
            result = self.converge() => {
                if let Err(e) = result {
                    error!(error = %e, "Initial backfill gave up");
                }
            }
        }

        let Some(every) = self.config.interval else {
            info!("Synchronizer finished startup catch-up");
            return;
        };

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and the startup pass just ran.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Synchronizer received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.converge().await {
                        error!(error = %e, "Periodic backfill gave up");
                    }
                }
            }
        }

        info!("Reconciliation synchronizer stopped");
    }
}
