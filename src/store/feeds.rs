use super::{lock, read, write, AggregationStore, StoreError};
use super::types::{FeedError, FeedId, FeedSource, ListId};
use crate::feed::{FeedMeta, FetchError, OpmlFeed};
use crate::util::{sanitize_name, validate_url, HostPolicy};

/// Outcome of [`AggregationStore::import_opml`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    /// Already subscribed; left where they were.
    pub existing: usize,
}

impl AggregationStore {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Subscribes to a feed and returns its id.
    ///
    /// Registration is idempotent by URL: an already-known URL returns the
    /// existing id, only replacing its title when `title` is non-blank.
    /// `list_id` defaults to the default list and is ignored for known feeds.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidUrl`] for anything but an absolute http(s) URL
    /// - [`StoreError::UnknownList`] if `list_id` does not exist
    pub fn add_feed(
        &self,
        url: &str,
        title: Option<&str>,
        list_id: Option<ListId>,
    ) -> Result<FeedId, StoreError> {
        // Host checks happen at fetch time, where the policy is configured
        validate_url(url, HostPolicy::AllowPrivate)
            .map_err(|e| StoreError::InvalidUrl(format!("{url}: {e}")))?;
        let url = url.trim();
        let title = title.and_then(sanitize_name);

        let mut catalog = write(&self.catalog);
        if let Some(existing) = catalog.feeds.values_mut().find(|f| f.url == url) {
            if let Some(title) = title {
                existing.title = title;
            }
            return Ok(existing.id);
        }

        let list_id = list_id.unwrap_or(ListId::DEFAULT);
        catalog.list(list_id)?;

        let id = FeedId(catalog.next_feed_id);
        catalog.next_feed_id += 1;
        catalog
            .feeds
            .insert(id, FeedSource::new(id, url, title.unwrap_or_default(), list_id));
        catalog.list_mut(list_id)?.feed_ids.push(id);

        tracing::debug!(feed_id = %id, url = %url, list_id = %list_id, "Feed registered");
        Ok(id)
    }

    /// Unsubscribes from a feed and deletes its articles.
    pub fn remove_feed(&self, feed_id: FeedId) -> Result<FeedSource, StoreError> {
        let mut catalog = write(&self.catalog);
        let feed = catalog
            .feeds
            .remove(&feed_id)
            .ok_or(StoreError::UnknownFeed(feed_id))?;
        if let Some(list) = catalog.lists.get_mut(&feed.list_id) {
            list.feed_ids.retain(|id| *id != feed_id);
        }

        let shard = write(&self.shards).remove(&feed_id);
        let removed = match shard {
            Some(shard) => {
                let shard = lock(&shard);
                let mut index = write(&self.index);
                for identity in shard.articles.keys() {
                    index.remove(identity);
                }
                shard.articles.len()
            }
            None => 0,
        };

        tracing::debug!(feed_id = %feed_id, articles = removed, "Feed removed");
        Ok(feed)
    }

    pub fn rename_feed(&self, feed_id: FeedId, title: &str) -> Result<(), StoreError> {
        let title = sanitize_name(title).ok_or(StoreError::InvalidName)?;
        write(&self.catalog).feed_mut(feed_id)?.title = title;
        Ok(())
    }

    /// Registers every OPML entry. A category naming an existing list
    /// (case-insensitive) selects that list; anything else lands in the
    /// default list.
    pub fn import_opml(&self, feeds: &[OpmlFeed]) -> ImportSummary {
        let mut summary = ImportSummary::default();
        for entry in feeds {
            if self.feed_by_url(&entry.xml_url).is_some() {
                summary.existing += 1;
                continue;
            }
            let list_id = entry
                .category
                .as_deref()
                .and_then(|name| self.list_by_name(name))
                .unwrap_or(ListId::DEFAULT);

            match self.add_feed(&entry.xml_url, Some(&entry.title), Some(list_id)) {
                Ok(id) => {
                    if let Some(site) = &entry.html_url {
                        if let Ok(feed) = write(&self.catalog).feed_mut(id) {
                            feed.site_url = Some(site.clone());
                        }
                    }
                    summary.added += 1;
                }
                Err(e) => {
                    tracing::warn!(url = %entry.xml_url, error = %e, "Skipping OPML entry");
                }
            }
        }
        tracing::info!(added = summary.added, existing = summary.existing, "OPML import finished");
        summary
    }

    // ========================================================================
    // Fetch bookkeeping
    // ========================================================================

    /// Records a successful fetch: stamps both timestamps, clears the last
    /// error, and backfills an unknown title or site link from `meta`.
    pub fn record_fetch_success(&self, feed_id: FeedId, meta: &FeedMeta) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut catalog = write(&self.catalog);
        let feed = catalog.feed_mut(feed_id)?;
        feed.last_fetched_at = Some(now);
        feed.last_success_at = Some(now);
        feed.last_error = None;
        if feed.title.is_empty() {
            if let Some(title) = sanitize_name(&meta.title) {
                feed.title = title;
            }
        }
        if feed.site_url.is_none() && !meta.link.is_empty() {
            feed.site_url = Some(meta.link.clone());
        }
        Ok(())
    }

    /// Records a failed fetch. `last_success_at` is left alone.
    pub fn record_fetch_failure(&self, feed_id: FeedId, error: &FetchError) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut catalog = write(&self.catalog);
        let feed = catalog.feed_mut(feed_id)?;
        feed.last_fetched_at = Some(now);
        feed.last_error = Some(FeedError::from(error));
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn feed(&self, feed_id: FeedId) -> Option<FeedSource> {
        read(&self.catalog).feeds.get(&feed_id).cloned()
    }

    pub fn feed_by_url(&self, url: &str) -> Option<FeedSource> {
        let url = url.trim();
        read(&self.catalog)
            .feeds
            .values()
            .find(|f| f.url == url)
            .cloned()
    }

    /// All feeds, by id.
    pub fn feeds(&self) -> Vec<FeedSource> {
        read(&self.catalog).feeds.values().cloned().collect()
    }

    /// Feeds of a list, in list order.
    pub fn feeds_in_list(&self, list_id: ListId) -> Result<Vec<FeedSource>, StoreError> {
        let catalog = read(&self.catalog);
        let list = catalog.list(list_id)?;
        Ok(list
            .feed_ids
            .iter()
            .filter_map(|id| catalog.feeds.get(id).cloned())
            .collect())
    }
}
