//! Owned element tree built from `quick-xml` events.
//!
//! Feeds are small enough that materializing the document is cheaper to reason
//! about than a streaming state machine, and it lets the normalizer express
//! field precedence as plain lookups.

use quick_xml::escape::{escape, resolve_predefined_entity};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::normalize::ParseError;

/// SEC-003: Maximum element nesting accepted before the document is rejected.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Element {
    /// Qualified name as written in the document, e.g. `content:encoded`.
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// First element named `name` in pre-order, including `self`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.elements().find_map(|e| e.find(name))
    }

    /// Every descendant named `name` in document order, excluding `self`.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        for child in self.elements() {
            child.collect_named(name, &mut out);
        }
        out
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        if self.name == name {
            out.push(self);
        }
        for child in self.elements() {
            child.collect_named(name, out);
        }
    }

    /// Concatenated text of this element and all its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.push_text(&mut out);
        out
    }

    fn push_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.push_text(out),
            }
        }
    }

    /// Text nodes that are direct children of this element only.
    pub fn own_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Child nodes serialized back to markup (used for Atom `type="xhtml"`).
    pub fn inner_xml(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            write_node(node, &mut out);
        }
        out
    }
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(t) => out.push_str(&escape(t.as_str())),
        Node::Element(e) => {
            out.push('<');
            out.push_str(&e.name);
            for (k, v) in &e.attrs {
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                out.push_str(&escape(v.as_str()));
                out.push('"');
            }
            if e.children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in &e.children {
                write_node(child, out);
            }
            out.push_str("</");
            out.push_str(&e.name);
            out.push('>');
        }
    }
}

/// Named entities that show up in real feeds despite not being declared.
///
/// quick-xml never expands DTD-declared entities (SEC-002), so anything not in
/// this table or the five XML builtins is kept as literal text.
fn resolve_entity(name: &str) -> Option<&'static str> {
    resolve_predefined_entity(name).or(match name {
        "nbsp" => Some("\u{a0}"),
        "ndash" => Some("\u{2013}"),
        "mdash" => Some("\u{2014}"),
        "hellip" => Some("\u{2026}"),
        "lsquo" => Some("\u{2018}"),
        "rsquo" => Some("\u{2019}"),
        "ldquo" => Some("\u{201c}"),
        "rdquo" => Some("\u{201d}"),
        "copy" => Some("\u{a9}"),
        "reg" => Some("\u{ae}"),
        "trade" => Some("\u{2122}"),
        _ => None,
    })
}

/// Resolves character references and the entities known to
/// [`resolve_entity`]. Anything else, including undeclared names and a bare
/// `&`, is kept as literal text.
fn unescape_lenient(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let resolved = tail
            .find(';')
            .and_then(|semi| resolve_reference(&tail[1..semi]).map(|c| (c, semi + 1)));
        match resolved {
            Some((text, consumed)) => {
                out.push_str(&text);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_reference(name: &str) -> Option<String> {
    let Some(number) = name.strip_prefix('#') else {
        return resolve_entity(name).map(str::to_owned);
    };
    let code = match number.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => number.parse::<u32>().ok()?,
    };
    char::from_u32(code).filter(|c| *c != '\0').map(String::from)
}

fn element_from(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Element {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::debug!(element = %name, error = %err, "Skipping malformed attribute");
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(v) => v.into_owned(),
            Err(_) => unescape_lenient(&String::from_utf8_lossy(&attr.value)),
        };
        attrs.push((key, value));
    }
    Element {
        name,
        attrs,
        children: Vec::new(),
    }
}

/// Parses a complete document into its root element.
///
/// Rejects documents that are not well-formed: mismatched or unclosed tags,
/// more than one root, character data outside the root, or nesting beyond
/// [`MAX_DEPTH`].
pub(crate) fn parse_document(bytes: &[u8]) -> Result<Element, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().check_end_names = true;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            ParseError::Malformed(format!("{} at byte {}", e, reader.buffer_position()))
        })?;

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::Malformed(format!(
                        "nesting exceeds {MAX_DEPTH} levels"
                    )));
                }
                stack.push(element_from(&e, &reader));
            }
            Event::Empty(e) => {
                let element = element_from(&e, &reader);
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParseError::Malformed("unexpected closing tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(t) => {
                let text = unescape_lenient(&String::from_utf8_lossy(&t));
                push_text(&mut stack, text)?;
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                push_text(&mut stack, text)?;
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and DOCTYPE carry no content
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Malformed(format!(
            "unclosed element <{}>",
            open.name
        )));
    }

    root.ok_or_else(|| ParseError::Malformed("document has no root element".into()))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(ParseError::Malformed(format!(
                "second root element <{}>",
                element.name
            )))
        }
    }
    Ok(())
}

fn push_text(stack: &mut [Element], text: String) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => {
            // Merge adjacent runs (text split around CDATA or entities)
            if let Some(Node::Text(prev)) = parent.children.last_mut() {
                prev.push_str(&text);
            } else {
                parent.children.push(Node::Text(text));
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(ParseError::Malformed(
            "character data outside the root element".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_tree_with_attributes() {
        let doc = parse_document(br#"<a x="1"><b>hi</b><c y="&amp;"/></a>"#).unwrap();
        assert_eq!(doc.name, "a");
        assert_eq!(doc.attr("x"), Some("1"));
        assert_eq!(doc.child("b").unwrap().text(), "hi");
        assert_eq!(doc.child("c").unwrap().attr("y"), Some("&"));
    }

    #[test]
    fn test_cdata_and_text_are_joined() {
        let doc = parse_document(b"<a>one <![CDATA[<b>two</b>]]> three</a>").unwrap();
        assert_eq!(doc.text(), "one <b>two</b> three");
    }

    #[test]
    fn test_html_entities_resolved() {
        let doc = parse_document(b"<a>x&nbsp;&mdash;&#65;&lt;</a>").unwrap();
        assert_eq!(doc.text(), "x\u{a0}\u{2014}A<");
    }

    #[test]
    fn test_unknown_entity_keeps_the_rest_decoded() {
        let doc = parse_document(b"<t>Tom &amp; Jerry &eacute;t&eacute; &#x263A;</t>").unwrap();
        assert_eq!(doc.text(), "Tom & Jerry &eacute;t&eacute; \u{263a}");
    }

    #[test]
    fn test_stray_ampersands_are_literal() {
        assert_eq!(unescape_lenient("AT&T; R&D &lt;3"), "AT&T; R&D <3");
        assert_eq!(unescape_lenient("&#0; &#xZZ; &"), "&#0; &#xZZ; &");
    }

    #[test]
    fn test_find_and_find_all_in_document_order() {
        let doc = parse_document(b"<r><x><i>1</i></x><i>2</i><i>3</i></r>").unwrap();
        let all: Vec<_> = doc.find_all("i").iter().map(|e| e.text()).collect();
        assert_eq!(all, vec!["1", "2", "3"]);
        assert_eq!(doc.find("i").unwrap().text(), "1");
        assert_eq!(doc.find("r").unwrap().name, "r");
    }

    #[test]
    fn test_own_text_skips_children() {
        let doc = parse_document(b"<author>Jane <name>J</name>Doe</author>").unwrap();
        assert_eq!(doc.own_text(), "Jane Doe");
        assert_eq!(doc.text(), "Jane JDoe");
    }

    #[test]
    fn test_inner_xml_round_trips_markup() {
        let doc = parse_document(br#"<content><div class="x">a &amp; <br/>b</div></content>"#)
            .unwrap();
        assert_eq!(doc.inner_xml(), r#"<div class="x">a &amp; <br/>b</div>"#);
    }

    #[test]
    fn test_bom_and_prolog_accepted() {
        let doc = parse_document(b"\xEF\xBB\xBF<?xml version=\"1.0\"?>\n<!-- c -->\n<r/>").unwrap();
        assert_eq!(doc.name, "r");
    }

    #[test]
    fn test_rejects_unclosed() {
        assert!(matches!(
            parse_document(b"<a><b></b>"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_document(b"<not valid xml"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_end() {
        assert!(matches!(
            parse_document(b"<a><b></a></b>"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_two_roots_and_stray_text() {
        assert!(parse_document(b"<a/><b/>").is_err());
        assert!(parse_document(b"<a/>trailing").is_err());
        assert!(parse_document(b"plain text").is_err());
        assert!(parse_document(b"").is_err());
    }

    #[test]
    fn test_rejects_excessive_nesting() {
        let doc = format!("{}{}", "<a>".repeat(MAX_DEPTH + 1), "</a>".repeat(MAX_DEPTH + 1));
        assert!(matches!(
            parse_document(doc.as_bytes()),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_declared_entities_not_expanded() {
        let doc = br#"<?xml version="1.0"?>
<!DOCTYPE r [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<r>&xxe;</r>"#;
        let root = parse_document(doc).unwrap();
        assert_eq!(root.text(), "&xxe;");
    }
}
