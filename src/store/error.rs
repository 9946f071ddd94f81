use thiserror::Error;

use super::types::{FeedId, ListId, TagId};
use crate::feed::ArticleIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown feed: {0}")]
    UnknownFeed(FeedId),
    #[error("unknown list: {0}")]
    UnknownList(ListId),
    #[error("unknown article: {0}")]
    UnknownArticle(ArticleIdentity),
    #[error("unknown tag: {0}")]
    UnknownTag(TagId),
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),
    /// Blank after trimming and stripping control characters.
    #[error("name must not be empty")]
    InvalidName,
    #[error("the default list cannot be removed")]
    DefaultListImmutable,
}
