use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::normalize::RawItem;
use crate::util::collapse_whitespace;

/// Stable key recognizing the same article across repeated fetches.
///
/// Hex-encoded SHA-256, so it is safe to use as a map key, a database primary
/// key, or in a URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleIdentity(String);

impl ArticleIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an identity previously produced by [`identify`] (e.g. read back
    /// from storage or received from a UI).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for ArticleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the identity of `item` as published by the feed at `feed_url`.
///
/// - Non-empty `guid` (after trimming): `sha256(feed_url + "#" + guid)`.
/// - Otherwise: `sha256(feed_url + "#" + normalized_title + "#" + published_raw)`
///   where the title is lowercased and whitespace-collapsed and a missing
///   publish date counts as the empty string.
///
/// The GUID-less branch is a heuristic: two posts with the same title and the
/// same (or no) date in one feed collapse into one article.
pub fn identify(item: &RawItem, feed_url: &str) -> ArticleIdentity {
    let mut hasher = Sha256::new();
    hasher.update(feed_url.as_bytes());
    hasher.update(b"#");

    match item.guid.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
        Some(guid) => hasher.update(guid.as_bytes()),
        None => {
            let title = collapse_whitespace(&item.title).to_lowercase();
            hasher.update(title.as_bytes());
            hasher.update(b"#");
            hasher.update(item.published_at.as_deref().unwrap_or("").as_bytes());
        }
    }

    ArticleIdentity(format!("{:x}", hasher.finalize()))
}
