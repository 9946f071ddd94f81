//! Feed ingestion: fetching, parsing and identifying feed items.
//!
//! - [`normalize`] turns RSS or Atom bytes into [`FeedMeta`] plus [`RawItem`]s
//! - [`identify`] derives the stable [`ArticleIdentity`] of an item
//! - [`Fetcher`] downloads many feeds concurrently with per-feed isolation
//! - [`opml`] imports and exports subscription lists

mod fetcher;
mod identity;
mod normalize;
pub mod opml;
mod timestamp;
mod xml;

pub use fetcher::{
    ErrorKind, FetchConfig, FetchConfigError, FetchError, FetchOutcome, FetchResult, Fetcher,
    DEFAULT_CONCURRENCY_LIMIT, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_FEED_BYTES, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BASE_DELAY, DEFAULT_USER_AGENT,
};
pub use identity::{identify, ArticleIdentity};
pub use normalize::{normalize, FeedFormat, FeedMeta, ParseError, RawItem};
pub use opml::{OpmlError, OpmlFeed};
pub use timestamp::parse_timestamp;
