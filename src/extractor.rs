use std::cell::RefCell;
use std::sync::OnceLock;

use html5ever::tendril::TendrilSink;
use html5ever::{Attribute, LocalName, parse_document};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use regex::Regex;

/// Turns rendered HTML into plain text. `None` means nothing worth scoring.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, html: &str, source_url: &str) -> Option<String>;
}

static NEWLINE_INDENT: OnceLock<Regex> = OnceLock::new();
static SPACE_RUNS: OnceLock<Regex> = OnceLock::new();

/// Drops indentation after line breaks and squeezes runs of spaces.
pub fn normalize_whitespace(text: &str) -> String {
    let newline_indent = NEWLINE_INDENT.get_or_init(|| Regex::new(r"\n\s+").expect("static regex"));
    let space_runs = SPACE_RUNS.get_or_init(|| Regex::new(r" {2,}").expect("static regex"));
    let text = newline_indent.replace_all(text, "\n");
    let text = space_runs.replace_all(&text, " ");
    text.trim().to_string()
}

/// Article-style extraction: walks the DOM, skipping scripts, styles and
/// navigation chrome, and keeps the readable text in document order.
#[derive(Debug, Default)]
pub struct ReadableExtractor;

impl ReadableExtractor {
    pub fn get_dom(html: &str) -> Option<RcDom> {
        parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .read_from(&mut html.as_bytes())
            .ok()
    }

    pub fn has_boilerplate_class_or_id(attrs: &RefCell<Vec<Attribute>>) -> bool {
        attrs.borrow().iter().any(|attr| {
            let name = &*attr.name.local;
            if name != "class" && name != "id" {
                return false;
            }
            let v = attr.value.to_lowercase();
            v.contains("nav")
                || v.contains("menu")
                || v.contains("sidebar")
                || v.contains("footer")
                || v.contains("cookie")
                || v.contains("banner")
                || v.contains("promo")
                || v.contains("advert")
        })
    }

    fn is_skipped(local: &LocalName) -> bool {
        matches!(
            &**local,
            "script" | "style" | "noscript" | "template" | "svg" | "iframe" | "nav" | "footer" | "aside" | "form" | "head"
        )
    }

    fn is_block_like(local: &LocalName) -> bool {
        matches!(
            &**local,
            "p" | "div"
                | "section"
                | "article"
                | "main"
                | "li"
                | "ul"
                | "ol"
                | "br"
                | "tr"
                | "table"
                | "blockquote"
                | "pre"
                | "h1"
                | "h2"
                | "h3"
                | "h4"
                | "h5"
                | "h6"
        )
    }

    pub fn walk_html(handle: &Handle, out: &mut String) {
        match &handle.data {
            NodeData::Text { contents } => {
                let s = contents.borrow();
                let s = s.trim();
                if s.is_empty() {
                    return;
                }
                if !out.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
                    out.push(' ');
                }
                out.push_str(s);
            }
            NodeData::Element { name, attrs, .. } => {
                let local = &name.local;
                if Self::is_skipped(local) || Self::has_boilerplate_class_or_id(attrs) {
                    return;
                }

                let block = Self::is_block_like(local);
                if block && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                for child in handle.children.borrow().iter() {
                    Self::walk_html(child, out);
                }
                if block && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {
                for child in handle.children.borrow().iter() {
                    Self::walk_html(child, out);
                }
            }
        }
    }
}

impl ContentExtractor for ReadableExtractor {
    fn extract(&self, html: &str, source_url: &str) -> Option<String> {
        let Some(dom) = Self::get_dom(html) else {
            log::debug!("could not parse html from {source_url}");
            return None;
        };
        let mut raw = String::new();
        Self::walk_html(&dom.document, &mut raw);
        let text = normalize_whitespace(&raw);
        (!text.is_empty()).then_some(text)
    }
}

/// Renders the whole document with html2text, keeping link targets.
#[derive(Debug)]
pub struct PlainTextExtractor {
    width: usize,
}

impl PlainTextExtractor {
    pub fn new(width: usize) -> Self {
        Self { width }
    }
}

impl Default for PlainTextExtractor {
    fn default() -> Self {
        Self { width: 100 }
    }
}

impl ContentExtractor for PlainTextExtractor {
    fn extract(&self, html: &str, source_url: &str) -> Option<String> {
        match html2text::from_read(html.as_bytes(), self.width) {
            Ok(text) => {
                let text = normalize_whitespace(&text);
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                log::debug!("html2text failed on {source_url}: {e}");
                None
            }
        }
    }
}
