//! RSS 2.0 / RSS 1.0 / Atom detection and normalization into [`RawItem`]s.
//!
//! Field precedence per dialect:
//!
//! | Field | RSS | Atom |
//! |---|---|---|
//! | content | `content:encoded` → `content` → `description` | `content` → `summary` |
//! | author | `author` → `dc:creator` | `author/name` → `author` text |
//! | published | `pubDate` → `dc:date` (raw) | `published` → `updated` (raw) |
//! | guid | `guid` | `id` |
//! | enclosure | `enclosure@url` | never (see [`normalize`]) |

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::xml::{parse_document, Element};

/// Errors that make a fetched document unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Not well-formed XML.
    #[error("malformed XML: {0}")]
    Malformed(String),
    /// Well-formed XML with neither an RSS nor an Atom root.
    #[error("unknown feed format: no <rss>, <channel> or <feed> element")]
    UnknownFormat,
    /// Recognized dialect but a required element is absent.
    #[error("missing required <{0}> element")]
    MissingElement(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Rss,
    Atom,
}

/// Channel-level metadata, used to backfill a feed's title and site link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMeta {
    pub format: FeedFormat,
    pub title: String,
    /// Website link of the feed (not the feed URL itself). Empty when absent.
    pub link: String,
    pub description: String,
}

/// One entry of a parsed document, before identity resolution.
///
/// `published_at` keeps the upstream string untouched; parsing happens at
/// merge time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub content_html: String,
    pub summary_html: String,
    pub published_at: Option<String>,
    pub guid: Option<String>,
    pub author: Option<String>,
    pub enclosure_url: Option<String>,
}

/// Parses a feed document and flattens it into channel metadata plus items.
///
/// `source_url` is the URL the bytes were fetched from; relative item links
/// and enclosure URLs are resolved against the channel link, falling back to
/// `source_url`.
///
/// Detection: an `<rss>` root or any `<channel>` element selects RSS (items
/// are collected document-wide so RSS 1.0/RDF works too); otherwise a
/// `<feed>` element selects Atom.
///
/// Atom `link rel="enclosure"` is not read; `enclosure_url` is always `None`
/// for Atom entries.
///
/// # Errors
///
/// - [`ParseError::Malformed`] if the bytes are not well-formed XML
/// - [`ParseError::UnknownFormat`] if no RSS or Atom root is present
/// - [`ParseError::MissingElement`] for an `<rss>` document without `<channel>`
pub fn normalize(bytes: &[u8], source_url: &str) -> Result<(FeedMeta, Vec<RawItem>), ParseError> {
    let root = parse_document(bytes)?;

    let has_channel = root.find("channel").is_some();
    let (meta, items) = if root.name == "rss" || has_channel {
        normalize_rss(&root)?
    } else if let Some(feed) = root.find("feed") {
        normalize_atom(feed)
    } else {
        return Err(ParseError::UnknownFormat);
    };

    let base = base_url(&meta.link, source_url);
    let items = items
        .into_iter()
        .map(|mut item| {
            if let Some(base) = &base {
                item.link = resolve(base, &item.link);
                item.enclosure_url = item.enclosure_url.map(|u| resolve(base, &u));
            }
            item
        })
        .collect::<Vec<_>>();

    tracing::debug!(
        url = %source_url,
        format = ?meta.format,
        items = items.len(),
        "Normalized feed"
    );
    Ok((meta, items))
}

fn normalize_rss(root: &Element) -> Result<(FeedMeta, Vec<RawItem>), ParseError> {
    let channel = root
        .find("channel")
        .ok_or(ParseError::MissingElement("channel"))?;

    let meta = FeedMeta {
        format: FeedFormat::Rss,
        title: child_text(channel, "title"),
        link: child_text(channel, "link"),
        description: child_text(channel, "description"),
    };

    let items = root.find_all("item").into_iter().map(rss_item).collect();
    Ok((meta, items))
}

fn rss_item(item: &Element) -> RawItem {
    let guid = non_empty(child_text(item, "guid"));
    let mut link = child_text(item, "link");

    // RSS 2.0: a guid without isPermaLink="false" is the item's URL
    if link.is_empty() {
        if let (Some(guid), Some(el)) = (&guid, item.child("guid")) {
            let permalink = el.attr("isPermaLink").map_or(true, |v| v != "false");
            if permalink && Url::parse(guid).is_ok() {
                link = guid.clone();
            }
        }
    }

    RawItem {
        title: child_text(item, "title"),
        link,
        content_html: first_non_empty(item, &["content:encoded", "content", "description"])
            .unwrap_or_default(),
        summary_html: child_text(item, "description"),
        published_at: first_non_empty(item, &["pubDate", "dc:date"]),
        guid,
        author: first_non_empty(item, &["author", "dc:creator"]),
        enclosure_url: item
            .child("enclosure")
            .and_then(|e| e.attr("url"))
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_owned),
    }
}

fn normalize_atom(feed: &Element) -> (FeedMeta, Vec<RawItem>) {
    let meta = FeedMeta {
        format: FeedFormat::Atom,
        title: child_text(feed, "title"),
        link: atom_alternate_link(feed),
        description: child_text(feed, "subtitle"),
    };
    let items = feed.find_all("entry").into_iter().map(atom_entry).collect();
    (meta, items)
}

fn atom_entry(entry: &Element) -> RawItem {
    let summary = child_text(entry, "summary");
    let content = entry
        .child("content")
        .map(|c| match c.attr("type") {
            Some("xhtml") => c.inner_xml().trim().to_owned(),
            _ => c.text().trim().to_owned(),
        })
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| summary.clone());

    RawItem {
        title: child_text(entry, "title"),
        link: atom_alternate_link(entry),
        content_html: content,
        summary_html: summary,
        published_at: first_non_empty(entry, &["published", "updated"]),
        guid: non_empty(child_text(entry, "id")),
        author: atom_author(entry),
        enclosure_url: None,
    }
}

/// `<link>` with `rel="alternate"` or no `rel`; the first one carrying an
/// `href` wins.
fn atom_alternate_link(el: &Element) -> String {
    el.children_named("link")
        .filter(|l| matches!(l.attr("rel"), None | Some("alternate")))
        .find_map(|l| l.attr("href").map(str::trim).filter(|h| !h.is_empty()))
        .map(str::to_owned)
        .unwrap_or_default()
}

fn atom_author(el: &Element) -> Option<String> {
    let author = el.child("author")?;
    non_empty(child_text(author, "name")).or_else(|| non_empty(author.own_text().trim().to_owned()))
}

fn child_text(el: &Element, name: &str) -> String {
    el.child(name)
        .map(|c| c.text().trim().to_owned())
        .unwrap_or_default()
}

fn first_non_empty(el: &Element, names: &[&str]) -> Option<String> {
    names
        .iter()
        .map(|name| child_text(el, name))
        .find(|text| !text.is_empty())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn base_url(channel_link: &str, source_url: &str) -> Option<Url> {
    Url::parse(channel_link)
        .ok()
        .or_else(|| Url::parse(source_url).ok())
}

fn resolve(base: &Url, link: &str) -> String {
    if link.is_empty() || Url::parse(link).is_ok() {
        return link.to_owned();
    }
    base.join(link)
        .map(String::from)
        .unwrap_or_else(|_| link.to_owned())
}
