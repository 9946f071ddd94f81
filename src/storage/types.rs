use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::feed::ArticleIdentity;
use crate::store::{Article, FeedError, FeedId, FeedSource, ListId, PublishedAt, TagId};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The database is locked by another feedmill process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored row could not be turned back into a store value
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface
// as messages rather than typed codes through sqlx.
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Timestamp Encoding
// ============================================================================

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DatabaseError::InvalidRow(format!("timestamp out of range: {ms}")))
}

fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    ms.map(from_millis).transpose()
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub list_id: i64,
    pub site_url: Option<String>,
    pub last_fetched_at: Option<i64>,
    pub last_success_at: Option<i64>,
    /// JSON-encoded [`FeedError`]
    pub last_error: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Result<FeedSource, DatabaseError> {
        let last_error = match self.last_error {
            Some(json) => Some(
                serde_json::from_str::<FeedError>(&json)
                    .map_err(|e| DatabaseError::InvalidRow(format!("feed {} error: {e}", self.id)))?,
            ),
            None => None,
        };
        Ok(FeedSource {
            id: FeedId(self.id),
            url: self.url,
            title: self.title,
            list_id: ListId(self.list_id),
            site_url: self.site_url,
            last_fetched_at: from_millis_opt(self.last_fetched_at)?,
            last_success_at: from_millis_opt(self.last_success_at)?,
            last_error,
        })
    }
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub identity: String,
    pub feed_id: i64,
    pub title: String,
    pub content_html: String,
    pub summary_html: String,
    pub link: String,
    pub published_raw: Option<String>,
    pub published_at: i64,
    pub published_estimated: bool,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

impl ArticleDbRow {
    /// Tags live in `article_tags` and are attached by the caller.
    pub(crate) fn into_article(self, tags: BTreeSet<TagId>) -> Result<Article, DatabaseError> {
        Ok(Article {
            identity: ArticleIdentity::from_raw(self.identity),
            feed_id: FeedId(self.feed_id),
            title: self.title,
            content_html: self.content_html,
            summary_html: self.summary_html,
            link: self.link,
            published_at: PublishedAt {
                raw: self.published_raw,
                at: from_millis(self.published_at)?,
                estimated: self.published_estimated,
            },
            author: self.author,
            image_url: self.image_url,
            is_read: self.is_read,
            tags,
            first_seen_at: from_millis(self.first_seen_at)?,
            last_seen_at: from_millis(self.last_seen_at)?,
        })
    }
}
