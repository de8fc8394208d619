//! Cleanup passes applied to composed Markdown.
//!
//! Each pass is a `&str -> String` function; [`normalize_markdown`] runs them
//! in order. Passes that rewrite prose leave fenced code untouched.

use std::sync::LazyLock;

use regex::Regex;

/// Run every cleanup pass over `md`.
pub fn normalize_markdown(md: &str) -> String {
    let mut result = strip_outer_fence(md);

    result = normalize_headings(&result);
    result = fix_code_block_languages(&result);
    result = strip_leftover_html(&result);
    result = normalize_whitespace(&result);
    result = collapse_blank_lines(&result);
    result = ensure_trailing_newline(&result);

    result
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Apply `f` to every line outside fenced code blocks.
fn map_prose_lines(md: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut in_code = false;
    md.lines()
        .map(|line| {
            if is_fence(line) {
                in_code = !in_code;
                line.to_string()
            } else if in_code {
                line.to_string()
            } else {
                f(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass: unwrap a response wrapped in a ```markdown fence
// ---------------------------------------------------------------------------

fn strip_outer_fence(md: &str) -> String {
    let trimmed = md.trim();
    let Some((first, rest)) = trimmed.split_once('\n') else {
        return md.to_string();
    };
    let lang = first.trim().trim_start_matches('`').trim().to_lowercase();
    if !first.trim().starts_with("```") || !matches!(lang.as_str(), "markdown" | "md") {
        return md.to_string();
    }
    match rest.trim_end().strip_suffix("```") {
        Some(body) => body.trim_end().to_string(),
        None => md.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Pass: keep a single H1
// ---------------------------------------------------------------------------

/// Demote every H1 after the first to H2.
fn normalize_headings(md: &str) -> String {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#\s+(.+)$").expect("valid regex"));

    let mut seen_h1 = false;
    map_prose_lines(md, |line| match H1_RE.captures(line) {
        Some(caps) if seen_h1 => format!("## {}", &caps[1]),
        Some(_) => {
            seen_h1 = true;
            line.to_string()
        }
        None => line.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Pass: code fence language hints
// ---------------------------------------------------------------------------

/// Turn `language-js`, `lang-python`, `highlight-rust` fence hints into the bare name.
fn fix_code_block_languages(md: &str) -> String {
    static LANG_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^```(?:language-|lang-|highlight-)(\w+)").expect("valid regex")
    });

    LANG_PREFIX_RE.replace_all(md, "```$1").to_string()
}

// ---------------------------------------------------------------------------
// Pass: stray layout tags
// ---------------------------------------------------------------------------

/// Remove layout tags that leaked through, keeping their text.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|main|figure|figcaption|font|center)(?:\s[^>]*)?>",
        )
        .expect("valid regex")
    });

    map_prose_lines(md, |line| HTML_TAG_RE.replace_all(line, "").to_string())
}

// ---------------------------------------------------------------------------
// Pass: whitespace
// ---------------------------------------------------------------------------

fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of blank lines into one.
fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE
        .replace_all(md.trim_start_matches('\n'), "\n\n")
        .to_string()
}

fn ensure_trailing_newline(md: &str) -> String {
    let trimmed = md.trim_end_matches('\n');
    format!("{trimmed}\n")
}
