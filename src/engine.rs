//! Refresh pipeline: fetch → normalize → identify → merge.
//!
//! Each feed is fetched under its per-feed lock and merged into the store
//! right after its fetch completes, still holding that lock. The merge is
//! synchronous, so dropping a refresh future (for example through
//! `futures::future::abortable`) discards unfinished fetches without ever
//! leaving a half-applied merge behind.

use futures::future;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::feed::{FetchOutcome, Fetcher};
use crate::store::{
    sort_articles, AggregationStore, Article, FeedError, FeedId, FeedSource, ListId, StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Updated { new_articles: usize, total: usize },
    Failed(FeedError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedReport {
    pub feed_id: FeedId,
    pub status: FeedStatus,
}

/// Outcome of a refresh: merged articles of every successful feed in
/// display order, plus one report per feed in completion order.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub articles: Vec<Article>,
    pub feeds: Vec<FeedReport>,
}

impl RefreshReport {
    pub fn failures(&self) -> impl Iterator<Item = (FeedId, &FeedError)> {
        self.feeds.iter().filter_map(|r| match &r.status {
            FeedStatus::Failed(e) => Some((r.feed_id, e)),
            FeedStatus::Updated { .. } => None,
        })
    }

    pub fn new_articles(&self) -> usize {
        self.feeds
            .iter()
            .map(|r| match r.status {
                FeedStatus::Updated { new_articles, .. } => new_articles,
                FeedStatus::Failed(_) => 0,
            })
            .sum()
    }
}

/// Store plus fetcher. Cheap to clone; clones share both.
#[derive(Clone)]
pub struct Engine {
    store: Arc<AggregationStore>,
    fetcher: Arc<Fetcher>,
}

impl Engine {
    pub fn new(store: Arc<AggregationStore>, fetcher: Arc<Fetcher>) -> Self {
        Self { store, fetcher }
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Refreshes a single feed. A fetch failure is reported in the returned
    /// report, not as an `Err`.
    pub async fn refresh_feed(&self, feed_id: FeedId) -> Result<RefreshReport, StoreError> {
        let source = self.store.feed(feed_id).ok_or(StoreError::UnknownFeed(feed_id))?;
        Ok(self.refresh_sources(vec![source], None).await)
    }

    /// Refreshes every feed of a list with bounded concurrency.
    pub async fn refresh_list(
        &self,
        list_id: ListId,
        progress_tx: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Result<RefreshReport, StoreError> {
        let sources = self.store.feeds_in_list(list_id)?;
        Ok(self.refresh_sources(sources, progress_tx).await)
    }

    /// Refreshes every registered feed.
    pub async fn refresh_all(
        &self,
        progress_tx: Option<mpsc::Sender<(usize, usize)>>,
    ) -> RefreshReport {
        let sources = self.store.feeds();
        self.refresh_sources(sources, progress_tx).await
    }

    async fn refresh_sources(
        &self,
        sources: Vec<FeedSource>,
        progress_tx: Option<mpsc::Sender<(usize, usize)>>,
    ) -> RefreshReport {
        if sources.is_empty() {
            return RefreshReport::default();
        }

        let total = sources.len();
        let completed = AtomicUsize::new(0);

        let applied: Vec<(FeedReport, Vec<Article>)> = stream::iter(sources)
            .map(|source| {
                let completed = &completed;
                let progress_tx = progress_tx.clone();
                async move {
                    let _guard = self.fetcher.lock_feed(source.id).await;
                    let outcome = self.fetcher.fetch_source(&source).await;
                    // No await between here and the end of the merge
                    let applied = self.apply(&source, outcome);

                    let done = completed.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                    if let Some(tx) = progress_tx {
                        if let Err(e) = tx.send((done, total)).await {
                            tracing::debug!(error = %e, done, total, "Progress receiver dropped");
                        }
                    }
                    applied
                }
            })
            .buffer_unordered(self.fetcher.config().concurrency_limit)
            .filter_map(future::ready)
            .collect()
            .await;

        let mut report = RefreshReport::default();
        for (feed_report, articles) in applied {
            report.feeds.push(feed_report);
            report.articles.extend(articles);
        }
        sort_articles(&mut report.articles);

        tracing::info!(
            feeds = report.feeds.len(),
            failed = report.failures().count(),
            new_articles = report.new_articles(),
            "Refresh complete"
        );
        report
    }

    /// Records the attempt on the feed and merges a successful result.
    /// `None` when the feed was removed while its fetch was in flight.
    fn apply(&self, source: &FeedSource, outcome: FetchOutcome) -> Option<(FeedReport, Vec<Article>)> {
        let result = match outcome {
            FetchOutcome::Success { meta, items } => self
                .store
                .record_fetch_success(source.id, &meta)
                .and_then(|()| self.store.merge_counting(source.id, &items))
                .map(|(articles, new_articles)| {
                    let status = FeedStatus::Updated {
                        new_articles,
                        total: articles.len(),
                    };
                    (status, articles)
                }),
            FetchOutcome::Failure(error) => self
                .store
                .record_fetch_failure(source.id, &error)
                .map(|()| (FeedStatus::Failed(FeedError::from(&error)), Vec::new())),
        };

        match result {
            Ok((status, articles)) => Some((
                FeedReport {
                    feed_id: source.id,
                    status,
                },
                articles,
            )),
            Err(e) => {
                tracing::debug!(feed_id = %source.id, error = %e, "Discarding result for removed feed");
                None
            }
        }
    }
}
