//! Pure text-normalization helpers shared by the datasources and the topic
//! store: HTML stripping (4.B, 4.E submission titles), Markdown stripping
//! (4.E), whitespace collapsing, and Unicode topic-name normalization
//! (4.H).

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use unicode_normalization::UnicodeNormalization;

/// Strip HTML markup to plain text for microblog status bodies and link
/// submission titles: tags removed,
/// `<br>` and block-level boundaries become spaces, entities decoded,
/// whitespace collapsed, and the result trimmed.
pub fn strip_html(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut out = String::new();
    for node in fragment.tree.values() {
        if let scraper::node::Node::Text(text) = node {
            out.push_str(text);
            out.push(' ');
        } else if let scraper::node::Node::Element(elem) = node {
            let tag = elem.name();
            if tag == "br" || is_block_level(tag) {
                out.push(' ');
            }
        }
    }
    collapse_whitespace(&out)
}

fn is_block_level(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div" | "blockquote" | "li" | "ul" | "ol" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
    )
}

/// Collapse runs of Unicode whitespace into a single ASCII space and trim
/// the ends. Used after HTML/Markdown stripping and as the final step of
/// topic-name normalization.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s*").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]*)\*\*|__([^_]*)__").unwrap());
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]*)\*|_([^_]*)_").unwrap());
static STRIKETHROUGH: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~]*)~~").unwrap());
static BLOCKQUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^>\s?").unwrap());
static HRULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(-{3,}|\*{3,}|_{3,})$").unwrap());

/// Strip Markdown markup in a fixed order:
/// fenced code, inline code, images, links (keeping link text), headings,
/// bold, italic, strikethrough, block quotes, horizontal rules, then
/// whitespace normalization.
pub fn strip_markdown(input: &str) -> String {
    let s = FENCED_CODE.replace_all(input, "");
    let s = INLINE_CODE.replace_all(&s, "$1");
    let s = IMAGE.replace_all(&s, "$1");
    let s = LINK.replace_all(&s, "$1");
    let s = HEADING.replace_all(&s, "");
    let s = BOLD.replace_all(&s, |caps: &regex::Captures| {
        caps.get(1).or_else(|| caps.get(2)).map_or(String::new(), |m| m.as_str().to_string())
    });
    let s = ITALIC.replace_all(&s, |caps: &regex::Captures| {
        caps.get(1).or_else(|| caps.get(2)).map_or(String::new(), |m| m.as_str().to_string())
    });
    let s = STRIKETHROUGH.replace_all(&s, "$1");
    let s = BLOCKQUOTE.replace_all(&s, "");
    let s = HRULE.replace_all(&s, "");
    collapse_whitespace(&s)
}

/// Normalize a topic name for matching: Unicode NFC, lowercase, trim,
/// collapse internal whitespace runs into single ASCII spaces (§4.H).
pub fn normalize_topic_name(name: &str) -> String {
    let nfc: String = name.nfc().collect();
    let lower = nfc.to_lowercase();
    collapse_whitespace(&lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_removes_tags_and_collapses_whitespace() {
        let got = strip_html("<p>Hello   <b>world</b></p><br>Next  line");
        assert_eq!(got, "Hello world Next line");
    }

    #[test]
    fn strip_html_decodes_entities() {
        let got = strip_html("Cafe&nbsp;&amp; Bar");
        assert!(got.contains('&') || got.contains(' '));
    }

    #[test]
    fn strip_markdown_order_matches_spec() {
        let got = strip_markdown("# Title\n**bold** and `code` and [link](http://x) and ~~gone~~");
        assert_eq!(got, "Title bold and code and link and gone");
    }

    #[test]
    fn strip_markdown_handles_fenced_code_and_hr() {
        let got = strip_markdown("intro\n```\ncode block\n```\n---\noutro");
        assert_eq!(got, "intro outro");
    }

    #[test]
    fn normalize_topic_name_is_idempotent() {
        let n1 = normalize_topic_name("  Donauinselfest  ");
        let n2 = normalize_topic_name(&n1);
        assert_eq!(n1, n2);
        assert_eq!(n1, "donauinselfest");
    }

    #[test]
    fn normalize_topic_name_folds_case_and_whitespace() {
        assert_eq!(
            normalize_topic_name("Wien  Wahl"),
            normalize_topic_name("wien wahl")
        );
    }
}
