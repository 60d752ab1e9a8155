//! Article field extraction.
//!
//! Each field is an ordered list of [`Strategy`] values. The first one that
//! yields non-empty trimmed text wins; a field nobody can fill stays `""`.
//! Extraction never fails.

use digestpipe_core::ParsedArticle;
use html_scraper::{ElementRef, Html, Selector};

/// One way to locate a node and read a value from it.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    /// Attribute of the first node matching `selector`.
    Attr {
        selector: &'static str,
        attr: &'static str,
    },
    /// Trimmed text of the first node matching `selector`, text nodes concatenated.
    Text { selector: &'static str },
}

pub const TITLE: &[Strategy] = &[
    Strategy::Attr {
        selector: r#"meta[property="og:title"]"#,
        attr: "content",
    },
    Strategy::Text {
        selector: "#activity-name",
    },
];

pub const AUTHOR: &[Strategy] = &[
    Strategy::Attr {
        selector: r#"meta[name="author"]"#,
        attr: "content",
    },
    Strategy::Text {
        selector: "#js_author_name",
    },
];

pub const PUBLISH_TIME: &[Strategy] = &[
    Strategy::Attr {
        selector: r#"meta[property="article:published_time"]"#,
        attr: "content",
    },
    Strategy::Text {
        selector: "#publish_time",
    },
];

pub const CONTENT_SELECTOR: &str = "#js_content";

fn first_match<'a>(doc: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel).next()
}

/// Trimmed, non-empty text nodes under `el`, skipping script-like containers.
fn text_pieces<'a>(el: ElementRef<'a>) -> impl Iterator<Item = &'a str> + 'a {
    el.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let in_script = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if in_script {
            return None;
        }
        let t = text.trim();
        (!t.is_empty()).then_some(t)
    })
}

fn node_text(el: ElementRef<'_>, sep: &str) -> String {
    text_pieces(el).collect::<Vec<_>>().join(sep)
}

impl Strategy {
    pub fn apply(&self, doc: &Html) -> Option<String> {
        let value = match *self {
            Strategy::Attr { selector, attr } => {
                first_match(doc, selector)?.value().attr(attr)?.trim().to_string()
            }
            Strategy::Text { selector } => node_text(first_match(doc, selector)?, ""),
        };
        (!value.is_empty()).then_some(value)
    }
}

pub fn first_non_empty(doc: &Html, strategies: &[Strategy]) -> String {
    strategies
        .iter()
        .find_map(|s| s.apply(doc))
        .unwrap_or_default()
}

/// Body text of the content container, one text node per line.
pub fn content_text(doc: &Html) -> String {
    first_match(doc, CONTENT_SELECTOR)
        .map(|el| node_text(el, "\n"))
        .unwrap_or_default()
}

pub fn extract(html: &str) -> ParsedArticle {
    let doc = Html::parse_document(html);
    ParsedArticle::new(
        first_non_empty(&doc, TITLE),
        first_non_empty(&doc, AUTHOR),
        first_non_empty(&doc, PUBLISH_TIME),
        content_text(&doc),
    )
}
