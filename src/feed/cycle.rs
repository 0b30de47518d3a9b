use thiserror::Error;

use super::fetcher::{FailureKind, FetchOutcome, Fetcher};
use super::normalizer::{normalize, NormalizeError};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::storage::{Database, Feed};
use crate::util::now_unix;

/// A cycle that could not complete. Fetch failures are not errors: they are
/// recorded on the feed and reported in [`CycleReport::status`].
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CycleStatus {
    #[default]
    NotModified,
    Modified,
    Failed {
        kind: FailureKind,
        error: String,
    },
}

/// What one fetch-normalize-dispatch pass did for one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub feed_id: i64,
    pub status: CycleStatus,
    pub new_entries: usize,
    pub dispatch: DispatchReport,
}

/// Everything needed to run one feed through a cycle.
#[derive(Clone)]
pub struct FeedCycle {
    db: Database,
    fetcher: Fetcher,
    dispatcher: Dispatcher,
}

impl FeedCycle {
    pub fn new(db: Database, fetcher: Fetcher, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            fetcher,
            dispatcher,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Fetch `feed`, store unseen items, record the outcome, and dispatch
    /// the new entries.
    ///
    /// For a modified document the new validators are recorded only after
    /// its entries are stored; if storing fails, the next tick refetches the
    /// full document instead of getting a 304.
    pub async fn run_cycle(&self, feed: &Feed) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport {
            feed_id: feed.id,
            ..CycleReport::default()
        };

        let outcome = self.fetcher.fetch(feed).await;
        if let FetchOutcome::Failed(failure) = &outcome {
            report.status = CycleStatus::Failed {
                kind: failure.kind,
                error: failure.error.to_string(),
            };
        }
        let mut doc = match outcome {
            FetchOutcome::Modified(doc) => doc,
            other => {
                self.record(feed, &other).await?;
                return Ok(report);
            }
        };
        report.status = CycleStatus::Modified;

        // Subscriptions first: once entries are stored they will not be
        // offered again, so a lookup failure must happen before that.
        let subscriptions = self
            .db
            .active_subscriptions_for(feed.id)
            .await
            .map_err(|e| CycleError::Storage(e.to_string()))?;

        // Relative links resolve against the freshest site link we know of.
        let mut resolved = feed.clone();
        if resolved.site_url.is_none() {
            resolved.site_url = doc.site_url.clone();
        }

        let items = std::mem::take(&mut doc.items);
        let item_count = items.len();
        let entries = normalize(&self.db, &resolved, items, now_unix()).await?;
        report.new_entries = entries.len();

        self.record(feed, &FetchOutcome::Modified(doc)).await?;

        if !entries.is_empty() {
            report.dispatch = self.dispatcher.dispatch_batch(&entries, &subscriptions).await;
        }

        if report.new_entries > 0 {
            tracing::info!(
                feed_id = feed.id,
                feed = %feed.display_name(),
                items = item_count,
                new_entries = report.new_entries,
                delivered = report.dispatch.delivered,
                failed = report.dispatch.failed,
                "Feed cycle complete"
            );
        } else {
            tracing::debug!(feed_id = feed.id, items = item_count, "Feed cycle found nothing new");
        }

        Ok(report)
    }

    async fn record(&self, feed: &Feed, outcome: &FetchOutcome) -> Result<(), CycleError> {
        self.fetcher
            .record(feed, outcome)
            .await
            .map_err(|e| CycleError::Storage(e.to_string()))
    }
}
