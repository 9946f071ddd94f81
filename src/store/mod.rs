//! In-memory aggregation store: feeds, lists, tags and deduplicated articles.
//!
//! # Locking
//!
//! Articles are sharded per feed behind their own mutex, so merges for
//! different feeds only contend on the shard map and the identity index.
//! Locks are always taken in this order and never re-entered:
//!
//! `catalog` → `shards` → one shard → `index`
//!
//! Read-state and tag updates look an article up in `index` first, but
//! release it before touching `shards`.

mod articles;
mod error;
mod feeds;
mod lists;
mod tags;
mod types;

pub use error::StoreError;
pub use feeds::ImportSummary;
pub use types::{
    display_order, sort_articles, Article, FeedError, FeedId, FeedList, FeedSource, ListId,
    PublishedAt, Scope, Tag, TagId, DEFAULT_LIST_NAME,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::clock::{Clock, SystemClock};
use crate::feed::ArticleIdentity;

/// Feed, list and tag metadata. Small and rarely written.
struct Catalog {
    feeds: BTreeMap<FeedId, FeedSource>,
    lists: BTreeMap<ListId, FeedList>,
    tags: BTreeMap<TagId, Tag>,
    next_feed_id: i64,
    next_list_id: i64,
    next_tag_id: i64,
}

impl Catalog {
    fn new() -> Self {
        let mut lists = BTreeMap::new();
        lists.insert(ListId::DEFAULT, default_list());
        Self {
            feeds: BTreeMap::new(),
            lists,
            tags: BTreeMap::new(),
            next_feed_id: 1,
            next_list_id: 1,
            next_tag_id: 1,
        }
    }

    fn feed(&self, id: FeedId) -> Result<&FeedSource, StoreError> {
        self.feeds.get(&id).ok_or(StoreError::UnknownFeed(id))
    }

    fn feed_mut(&mut self, id: FeedId) -> Result<&mut FeedSource, StoreError> {
        self.feeds.get_mut(&id).ok_or(StoreError::UnknownFeed(id))
    }

    fn list(&self, id: ListId) -> Result<&FeedList, StoreError> {
        self.lists.get(&id).ok_or(StoreError::UnknownList(id))
    }

    fn list_mut(&mut self, id: ListId) -> Result<&mut FeedList, StoreError> {
        self.lists.get_mut(&id).ok_or(StoreError::UnknownList(id))
    }

    /// Feed ids covered by `scope`.
    fn scope_feeds(&self, scope: Scope) -> Result<Vec<FeedId>, StoreError> {
        match scope {
            Scope::Feed(id) => self.feed(id).map(|f| vec![f.id]),
            Scope::List(id) => self.list(id).map(|l| l.feed_ids.clone()),
            Scope::All => Ok(self.feeds.keys().copied().collect()),
        }
    }
}

fn default_list() -> FeedList {
    FeedList {
        id: ListId::DEFAULT,
        name: DEFAULT_LIST_NAME.to_string(),
        feed_ids: Vec::new(),
    }
}

#[derive(Default)]
struct FeedShard {
    articles: HashMap<ArticleIdentity, Article>,
}

/// Plain-data copy of the whole store, used for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub feeds: Vec<FeedSource>,
    pub lists: Vec<FeedList>,
    pub tags: Vec<Tag>,
    pub articles: Vec<Article>,
}

/// Owner of all mutable engine state. Share it behind an `Arc`.
pub struct AggregationStore {
    catalog: RwLock<Catalog>,
    index: RwLock<HashMap<ArticleIdentity, FeedId>>,
    shards: RwLock<HashMap<FeedId, Arc<Mutex<FeedShard>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog: RwLock::new(Catalog::new()),
            index: RwLock::new(HashMap::new()),
            shards: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Rebuilds a store from a snapshot.
    ///
    /// Dangling references are repaired rather than rejected: feeds pointing
    /// at a missing list move to the default list, articles of unknown feeds
    /// are dropped, and unknown tag ids are detached.
    pub fn from_snapshot(snapshot: StoreSnapshot, clock: Arc<dyn Clock>) -> Self {
        let mut catalog = Catalog::new();

        for list in snapshot.lists {
            catalog.next_list_id = catalog.next_list_id.max(list.id.0 + 1);
            catalog.lists.insert(list.id, list);
        }
        for mut feed in snapshot.feeds {
            catalog.next_feed_id = catalog.next_feed_id.max(feed.id.0 + 1);
            if !catalog.lists.contains_key(&feed.list_id) {
                tracing::warn!(feed_id = %feed.id, list_id = %feed.list_id, "Feed references unknown list; moving to default list");
                feed.list_id = ListId::DEFAULT;
            }
            catalog.feeds.insert(feed.id, feed);
        }
        // Keep saved membership order, then append feeds the lists missed
        let feeds = &catalog.feeds;
        for list in catalog.lists.values_mut() {
            let list_id = list.id;
            let mut seen = HashSet::new();
            list.feed_ids
                .retain(|id| feeds.get(id).is_some_and(|f| f.list_id == list_id) && seen.insert(*id));
        }
        for feed in catalog.feeds.values() {
            if let Some(list) = catalog.lists.get_mut(&feed.list_id) {
                if !list.feed_ids.contains(&feed.id) {
                    list.feed_ids.push(feed.id);
                }
            }
        }
        for tag in snapshot.tags {
            catalog.next_tag_id = catalog.next_tag_id.max(tag.id.0 + 1);
            catalog.tags.insert(tag.id, tag);
        }

        let mut index = HashMap::new();
        let mut shards: HashMap<FeedId, FeedShard> = HashMap::new();
        let mut dropped = 0usize;
        for mut article in snapshot.articles {
            if !catalog.feeds.contains_key(&article.feed_id) {
                dropped += 1;
                continue;
            }
            article.tags.retain(|t| catalog.tags.contains_key(t));
            index.insert(article.identity.clone(), article.feed_id);
            shards
                .entry(article.feed_id)
                .or_default()
                .articles
                .insert(article.identity.clone(), article);
        }
        if dropped > 0 {
            tracing::warn!(dropped, "Dropped articles of unknown feeds while restoring snapshot");
        }

        Self {
            catalog: RwLock::new(catalog),
            index: RwLock::new(index),
            shards: RwLock::new(
                shards
                    .into_iter()
                    .map(|(id, shard)| (id, Arc::new(Mutex::new(shard))))
                    .collect(),
            ),
            clock,
        }
    }

    /// Consistent copy of the whole store. Articles are grouped by feed, in
    /// display order within each feed.
    pub fn snapshot(&self) -> StoreSnapshot {
        let catalog = read(&self.catalog);
        let shards = read(&self.shards);

        let mut articles = Vec::new();
        for feed_id in catalog.feeds.keys() {
            if let Some(shard) = shards.get(feed_id) {
                let mut feed_articles: Vec<Article> =
                    lock(shard).articles.values().cloned().collect();
                sort_articles(&mut feed_articles);
                articles.extend(feed_articles);
            }
        }

        StoreSnapshot {
            feeds: catalog.feeds.values().cloned().collect(),
            lists: catalog.lists.values().cloned().collect(),
            tags: catalog.tags.values().cloned().collect(),
            articles,
        }
    }

    /// Shard for `feed_id`, created on first use.
    fn shard(&self, feed_id: FeedId) -> Arc<Mutex<FeedShard>> {
        if let Some(shard) = read(&self.shards).get(&feed_id) {
            return Arc::clone(shard);
        }
        Arc::clone(write(&self.shards).entry(feed_id).or_default())
    }

    fn existing_shard(&self, feed_id: FeedId) -> Option<Arc<Mutex<FeedShard>>> {
        read(&self.shards).get(&feed_id).cloned()
    }
}

// A panic while holding one of these locks leaves plain data behind, never a
// half-applied invariant that later readers depend on, so poisoning is ignored.

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
