//! Read-only scanning of Markdown: headings, links, and prose text.

use std::sync::LazyLock;

use regex::Regex;

/// An ATX heading found in Markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: usize,
    pub text: String,
    /// Anchor a renderer would generate for the heading.
    pub slug: String,
}

/// An inline link (images excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub text: String,
    pub target: String,
}

impl Link {
    /// The anchor of an in-document link (`#slug`), if it is one.
    pub fn anchor(&self) -> Option<&str> {
        self.target.strip_prefix('#')
    }
}

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)(?:\s+#+)?\s*$").expect("valid regex"));

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(!?)\[([^\]]*)\]\(\s*<?([^)\s>]*)>?(?:\s+"[^"]*")?\s*\)"#).expect("valid regex")
});

static INLINE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`\n]*`").expect("valid regex"));

/// GitHub-style anchor slug: lowercase, spaces to hyphens, punctuation dropped.
///
/// Non-ASCII letters (kana, kanji, accented Latin) are kept.
pub fn slugify(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                Some('-')
            } else {
                None
            }
        })
        .collect()
}

/// Lines of `md` outside fenced code blocks.
pub fn prose_lines(md: &str) -> Vec<&str> {
    let mut in_code = false;
    md.lines()
        .filter(|line| {
            if line.trim_start().starts_with("```") {
                in_code = !in_code;
                return false;
            }
            !in_code
        })
        .collect()
}

/// Prose of `md` with fenced blocks and inline code spans removed.
pub fn prose_text(md: &str) -> String {
    prose_lines(md)
        .into_iter()
        .map(|line| INLINE_CODE_RE.replace_all(line, " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Every heading outside code, in document order.
pub fn headings(md: &str) -> Vec<Heading> {
    prose_lines(md)
        .into_iter()
        .filter_map(|line| {
            let caps = HEADING_RE.captures(line)?;
            let text = caps[2].trim().to_string();
            Some(Heading {
                level: caps[1].len(),
                slug: slugify(&text),
                text,
            })
        })
        .collect()
}

/// Every inline link outside code, in document order.
pub fn links(md: &str) -> Vec<Link> {
    let prose = prose_text(md);
    LINK_RE
        .captures_iter(&prose)
        .filter(|caps| caps[1].is_empty())
        .map(|caps| Link {
            text: caps[2].trim().to_string(),
            target: caps[3].to_string(),
        })
        .collect()
}
