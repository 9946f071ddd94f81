use std::collections::HashSet;

use super::{lock, read, write, AggregationStore, StoreError};
use super::types::{sort_articles, Article, FeedId, ListId, Scope};
use crate::feed::{identify, ArticleIdentity, FetchOutcome, FetchResult, RawItem};

impl AggregationStore {
    // ========================================================================
    // Merge
    // ========================================================================

    /// Merges freshly fetched items into a feed and returns the feed's full
    /// article set in display order.
    ///
    /// Known identities take the upstream title, content, link, author,
    /// image and publish date, and advance `last_seen_at`; their read state
    /// and tags are kept. Unknown identities become unread, untagged
    /// articles first seen now. Merging the same items twice is a no-op
    /// apart from `last_seen_at`.
    pub fn merge(&self, feed_id: FeedId, items: &[RawItem]) -> Result<Vec<Article>, StoreError> {
        self.merge_counting(feed_id, items).map(|(articles, _)| articles)
    }

    /// [`merge`](Self::merge), also returning how many articles were new.
    pub(crate) fn merge_counting(
        &self,
        feed_id: FeedId,
        items: &[RawItem],
    ) -> Result<(Vec<Article>, usize), StoreError> {
        // Held for the whole merge so the feed cannot be removed mid-way
        let catalog = read(&self.catalog);
        let feed_url = &catalog.feed(feed_id)?.url;
        let now = self.clock.now();

        let shard = self.shard(feed_id);
        let mut shard = lock(&shard);
        let mut created = Vec::new();

        for item in items {
            let identity = identify(item, feed_url);
            match shard.articles.get_mut(&identity) {
                Some(article) => article.refresh_from(item, now),
                None => {
                    let article = Article::from_item(identity.clone(), feed_id, item, now);
                    shard.articles.insert(identity.clone(), article);
                    created.push(identity);
                }
            }
        }

        if !created.is_empty() {
            let mut index = write(&self.index);
            for identity in &created {
                index.insert(identity.clone(), feed_id);
            }
        }

        let mut articles: Vec<Article> = shard.articles.values().cloned().collect();
        sort_articles(&mut articles);

        tracing::debug!(
            feed_id = %feed_id,
            items = items.len(),
            new = created.len(),
            total = articles.len(),
            "Merged feed items"
        );
        Ok((articles, created.len()))
    }

    /// Merges every successful result for a feed of `list_id` and returns
    /// their combined articles in display order.
    ///
    /// Failed results and results for feeds outside the list are skipped;
    /// the caller reports those.
    pub fn merge_list(
        &self,
        list_id: ListId,
        results: &[FetchResult],
    ) -> Result<Vec<Article>, StoreError> {
        let members: HashSet<FeedId> = read(&self.catalog)
            .list(list_id)?
            .feed_ids
            .iter()
            .copied()
            .collect();

        let mut combined = Vec::new();
        for result in results {
            let FetchOutcome::Success { items, .. } = &result.outcome else {
                continue;
            };
            if !members.contains(&result.feed_id) {
                tracing::debug!(feed_id = %result.feed_id, list_id = %list_id, "Skipping result outside list");
                continue;
            }
            match self.merge(result.feed_id, items) {
                Ok(articles) => combined.extend(articles),
                // Removed after the fetch started
                Err(StoreError::UnknownFeed(id)) => {
                    tracing::debug!(feed_id = %id, "Skipping result for removed feed");
                }
                Err(e) => return Err(e),
            }
        }

        sort_articles(&mut combined);
        Ok(combined)
    }

    // ========================================================================
    // Read state
    // ========================================================================

    /// Applies `f` to one article under its shard lock.
    pub(super) fn update_article<R>(
        &self,
        identity: &ArticleIdentity,
        f: impl FnOnce(&mut Article) -> R,
    ) -> Result<R, StoreError> {
        let unknown = || StoreError::UnknownArticle(identity.clone());
        let feed_id = read(&self.index).get(identity).copied().ok_or_else(unknown)?;
        let shard = self.existing_shard(feed_id).ok_or_else(unknown)?;
        let mut shard = lock(&shard);
        let article = shard.articles.get_mut(identity).ok_or_else(unknown)?;
        Ok(f(article))
    }

    /// Returns `false` if the article was already read.
    pub fn mark_read(&self, identity: &ArticleIdentity) -> Result<bool, StoreError> {
        self.update_article(identity, |a| !std::mem::replace(&mut a.is_read, true))
    }

    /// Returns `false` if the article was already unread.
    pub fn mark_unread(&self, identity: &ArticleIdentity) -> Result<bool, StoreError> {
        self.update_article(identity, |a| std::mem::replace(&mut a.is_read, false))
    }

    /// Marks every article in `scope` read and returns how many changed.
    pub fn mark_all_read(&self, scope: Scope) -> Result<usize, StoreError> {
        let catalog = read(&self.catalog);
        let mut changed = 0;
        for feed_id in catalog.scope_feeds(scope)? {
            let Some(shard) = self.existing_shard(feed_id) else {
                continue;
            };
            for article in lock(&shard).articles.values_mut() {
                if !article.is_read {
                    article.is_read = true;
                    changed += 1;
                }
            }
        }
        tracing::debug!(?scope, changed, "Marked all read");
        Ok(changed)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn article(&self, identity: &ArticleIdentity) -> Option<Article> {
        self.update_article(identity, |a| a.clone()).ok()
    }

    /// Articles in `scope`, in display order.
    pub fn articles(&self, scope: Scope) -> Result<Vec<Article>, StoreError> {
        let catalog = read(&self.catalog);
        let mut articles = Vec::new();
        for feed_id in catalog.scope_feeds(scope)? {
            if let Some(shard) = self.existing_shard(feed_id) {
                articles.extend(lock(&shard).articles.values().cloned());
            }
        }
        sort_articles(&mut articles);
        Ok(articles)
    }

    pub fn articles_for_feed(&self, feed_id: FeedId) -> Result<Vec<Article>, StoreError> {
        self.articles(Scope::Feed(feed_id))
    }

    pub fn articles_for_list(&self, list_id: ListId) -> Result<Vec<Article>, StoreError> {
        self.articles(Scope::List(list_id))
    }

    pub fn unread_count(&self, scope: Scope) -> Result<usize, StoreError> {
        let catalog = read(&self.catalog);
        let mut unread = 0;
        for feed_id in catalog.scope_feeds(scope)? {
            if let Some(shard) = self.existing_shard(feed_id) {
                unread += lock(&shard).articles.values().filter(|a| !a.is_read).count();
            }
        }
        Ok(unread)
    }
}
