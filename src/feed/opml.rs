use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use thiserror::Error;

use crate::store::{FeedList, FeedSource};
use crate::util::{validate_url, HostPolicy};

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack overflow attacks from maliciously crafted deeply nested OPMLs.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to write OPML: {0}")]
    Write(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed subscription extracted from an OPML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// `title` attribute, falling back to `text`, then to the XML URL.
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// `category` attribute, or the title of the enclosing folder outline.
    pub category: Option<String>,
}

/// Reads and parses an OPML file. See [`parse_str`].
pub async fn parse_file(path: &str, policy: HostPolicy) -> Result<Vec<OpmlFeed>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_str(&content, policy)
}

/// Extracts every `<outline>` carrying an `xmlUrl`, at any nesting depth.
///
/// Outlines without `xmlUrl` are folders: they are traversed and their
/// title becomes the category of the feeds inside them. Feeds whose URL is
/// rejected by `policy` are skipped with a warning.
pub fn parse_str(content: &str, policy: HostPolicy) -> Result<Vec<OpmlFeed>, OpmlError> {
    // SEC-002: quick-xml (0.37) never parses <!ENTITY> declarations; custom
    // entities fail in `decode_and_unescape_value()` instead of expanding.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // One entry per open <outline>: the folder name it contributes, if any.
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                // SEC-003: Reject excessively nested OPMLs
                if folders.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                let folder = if outline.xml_url.is_none() {
                    outline.title.clone()
                } else {
                    None
                };
                if let Some(feed) = outline.into_feed(&folders, policy) {
                    feeds.push(feed);
                }
                folders.push(folder);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                if let Some(feed) = read_outline(&e, &reader)?.into_feed(&folders, policy) {
                    feeds.push(feed);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                folders.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

#[derive(Default)]
struct Outline {
    title: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
    category: Option<String>,
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut outline = Outline::default();
    let mut text = None;
    let decoder = reader.decoder();

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
            .trim()
            .to_string();
        if value.is_empty() {
            continue;
        }
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value),
            b"htmlUrl" => outline.html_url = Some(value),
            b"title" => outline.title = Some(value),
            b"text" => text = Some(value),
            b"category" => outline.category = Some(value),
            _ => {}
        }
    }

    if outline.title.is_none() {
        outline.title = text;
    }
    Ok(outline)
}

impl Outline {
    fn into_feed(self, folders: &[Option<String>], policy: HostPolicy) -> Option<OpmlFeed> {
        let url = self.xml_url?;

        // SEC-002: Validate URL before accepting
        if let Err(e) = validate_url(&url, policy) {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            return None;
        }
        let html_url = self.html_url.filter(|html| match validate_url(html, policy) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(url = %html, error = %e, "Ignoring invalid htmlUrl in OPML");
                false
            }
        });
        let category = self
            .category
            .or_else(|| folders.iter().rev().find_map(|f| f.clone()));

        Some(OpmlFeed {
            title: self.title.unwrap_or_else(|| url.clone()),
            xml_url: url,
            html_url,
            category,
        })
    }
}

/// Exports subscriptions as OPML 2.0 with one folder outline per list.
///
/// Feed outlines also carry a `category` attribute naming their list, so
/// readers that flatten folders keep the grouping.
pub fn export_opml(lists: &[FeedList], feeds: &[FeedSource]) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    write(&mut writer, Event::Start(opml))?;

    write(&mut writer, Event::Start(BytesStart::new("head")))?;
    write(&mut writer, Event::Start(BytesStart::new("title")))?;
    write(&mut writer, Event::Text(BytesText::new("feedmill subscriptions")))?;
    write(&mut writer, Event::End(BytesEnd::new("title")))?;
    write(&mut writer, Event::End(BytesEnd::new("head")))?;

    write(&mut writer, Event::Start(BytesStart::new("body")))?;
    for list in lists {
        let mut folder = BytesStart::new("outline");
        folder.push_attribute(("text", list.name.as_str()));
        folder.push_attribute(("title", list.name.as_str()));
        write(&mut writer, Event::Start(folder))?;

        for feed in list
            .feed_ids
            .iter()
            .filter_map(|id| feeds.iter().find(|f| f.id == *id))
        {
            let title = feed.display_title();
            let mut outline = BytesStart::new("outline");
            outline.push_attribute(("type", "rss"));
            outline.push_attribute(("text", title));
            outline.push_attribute(("title", title));
            outline.push_attribute(("xmlUrl", feed.url.as_str()));
            if let Some(ref site) = feed.site_url {
                outline.push_attribute(("htmlUrl", site.as_str()));
            }
            outline.push_attribute(("category", list.name.as_str()));
            write(&mut writer, Event::Empty(outline))?;
        }

        write(&mut writer, Event::End(BytesEnd::new("outline")))?;
    }
    write(&mut writer, Event::End(BytesEnd::new("body")))?;
    write(&mut writer, Event::End(BytesEnd::new("opml")))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| OpmlError::Write(e.to_string()))
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<(), OpmlError> {
    writer
        .write_event(event)
        .map_err(|e| OpmlError::Write(e.to_string()))
}

/// Writes an OPML export to `path` atomically.
///
/// The document goes to a temporary sibling first, is synced, then renamed
/// over the destination, so a crash never leaves a truncated file.
pub fn export_to_file(
    lists: &[FeedList],
    feeds: &[FeedSource],
    path: &std::path::Path,
) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(lists, feeds)?;

    // SEC-009: Randomized temp filename to prevent TOCTOU race conditions
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temporary file '{}'", temp_path.display()))?;

    let written = std::io::Write::write_all(&mut file, content.as_bytes())
        .and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).with_context(|| {
            format!("Failed to write OPML to '{}'", temp_path.display())
        });
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
