use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::feed::{parse_timestamp, ArticleIdentity, ErrorKind, FetchError, RawItem};

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(FeedId);
id_type!(
    /// [`ListId::DEFAULT`] always exists and cannot be removed.
    ListId
);
id_type!(TagId);

pub const DEFAULT_LIST_NAME: &str = "Newsfeed";

impl ListId {
    pub const DEFAULT: ListId = ListId(0);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

// ============================================================================
// Feeds, lists, tags
// ============================================================================

/// Last failure of a feed, kept for status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FetchError> for FeedError {
    fn from(err: &FetchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A subscribed feed.
///
/// `last_fetched_at`, `last_success_at` and `last_error` only change as the
/// result of a fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSource {
    pub id: FeedId,
    pub url: String,
    /// Empty until supplied at registration or backfilled from the feed.
    pub title: String,
    pub list_id: ListId,
    /// Website of the feed, backfilled from the channel link.
    pub site_url: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<FeedError>,
}

impl FeedSource {
    pub fn new(id: FeedId, url: impl Into<String>, title: impl Into<String>, list_id: ListId) -> Self {
        Self {
            id,
            url: url.into(),
            title: title.into(),
            list_id,
            site_url: None,
            last_fetched_at: None,
            last_success_at: None,
            last_error: None,
        }
    }

    /// Title for display: the feed title, or its URL when unknown.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }
}

/// Named grouping of feeds. Owns no articles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedList {
    pub id: ListId,
    pub name: String,
    /// Insertion-ordered, no duplicates.
    pub feed_ids: Vec<FeedId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub color: Option<String>,
}

/// Target of bulk read-state operations and counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Feed(FeedId),
    List(ListId),
    All,
}

// ============================================================================
// Articles
// ============================================================================

/// Publication time of an article.
///
/// `raw` is the upstream string. When it is missing or unparseable, `at`
/// holds the article's first sighting and `estimated` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAt {
    pub raw: Option<String>,
    pub at: DateTime<Utc>,
    pub estimated: bool,
}

impl PublishedAt {
    pub(crate) fn resolve(raw: Option<&str>, fallback: DateTime<Utc>) -> Self {
        match raw.and_then(parse_timestamp) {
            Some(at) => Self {
                raw: raw.map(str::to_string),
                at,
                estimated: false,
            },
            None => Self {
                raw: raw.map(str::to_string),
                at: fallback,
                estimated: true,
            },
        }
    }
}

/// Deduplicated article, keyed by [`ArticleIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub identity: ArticleIdentity,
    pub feed_id: FeedId,
    pub title: String,
    pub content_html: String,
    pub summary_html: String,
    pub link: String,
    pub published_at: PublishedAt,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub tags: BTreeSet<TagId>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Article {
    pub(crate) fn from_item(
        identity: ArticleIdentity,
        feed_id: FeedId,
        item: &RawItem,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            feed_id,
            title: item.title.clone(),
            content_html: item.content_html.clone(),
            summary_html: item.summary_html.clone(),
            link: item.link.clone(),
            published_at: PublishedAt::resolve(item.published_at.as_deref(), now),
            author: item.author.clone(),
            image_url: item.enclosure_url.clone(),
            is_read: false,
            tags: BTreeSet::new(),
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Takes upstream edits from `item`. Read state and tags are untouched.
    pub(crate) fn refresh_from(&mut self, item: &RawItem, now: DateTime<Utc>) {
        self.title.clone_from(&item.title);
        self.content_html.clone_from(&item.content_html);
        self.summary_html.clone_from(&item.summary_html);
        self.link.clone_from(&item.link);
        self.author.clone_from(&item.author);
        self.image_url.clone_from(&item.enclosure_url);
        self.published_at = PublishedAt::resolve(item.published_at.as_deref(), self.first_seen_at);
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }
}

/// Display order: newest `published_at` first, then most recently
/// discovered, then identity.
pub fn display_order(a: &Article, b: &Article) -> Ordering {
    b.published_at
        .at
        .cmp(&a.published_at.at)
        .then_with(|| b.first_seen_at.cmp(&a.first_seen_at))
        .then_with(|| a.identity.cmp(&b.identity))
}

pub fn sort_articles(articles: &mut [Article]) {
    articles.sort_by(display_order);
}
