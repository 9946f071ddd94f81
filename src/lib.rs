//! Feed aggregation engine.
//!
//! Fetches RSS 2.0 and Atom 1.0 documents concurrently, normalizes them into
//! a common item shape and merges the items into a deduplicated article
//! store that keeps user state (read flags, tags) across refreshes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedmill::{engine::Engine, feed::{FetchConfig, Fetcher}, store::AggregationStore};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Arc::new(AggregationStore::new());
//! store.add_feed("https://blog.example/feed.xml", None, None)?;
//! let engine = Engine::new(store, Arc::new(Fetcher::new(FetchConfig::default())?));
//! let report = engine.refresh_all(None).await;
//! println!("{} new articles", report.new_articles());
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod feed;
pub mod storage;
pub mod store;
pub mod util;
pub mod wire;
