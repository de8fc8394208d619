//! Structural validation of composed Markdown.
//!
//! No model call happens here. The report combines the structural checks
//! with the claims left by the grounding check.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument};

use html2doc_markdown::{headings, links, prose_text};
use html2doc_shared::{DocumentState, Result, ValidationReport};

use crate::orchestrator::Stage;

static LATIN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("valid regex"));

static HYPHENATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+(?:-[A-Za-z]+)+").expect("valid regex"));

static KATAKANA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{Katakana}ー]+").expect("valid regex"));

/// Builds the [`ValidationReport`] for the current composition.
#[derive(Debug, Default)]
pub struct OutputValidator;

impl OutputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate `state.markdown` and store the report on the state.
    #[instrument(skip_all, fields(stem = %state.metadata.stem, revision = state.revision_count))]
    pub fn validate(&self, state: &mut DocumentState) -> Result<()> {
        let report = build_report(state);
        info!(passed = report.passed, issues = report.issue_count(), "{}", report.summary());
        state.report = Some(report);
        Ok(())
    }
}

#[async_trait]
impl Stage for OutputValidator {
    fn name(&self) -> &'static str {
        "validating"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        self.validate(state)
    }
}

/// Run every check over the state's Markdown.
pub fn build_report(state: &DocumentState) -> ValidationReport {
    let md = &state.markdown;
    let found = headings(md);
    let heading_texts: HashSet<String> = found.iter().map(|h| normalize(&h.text)).collect();
    let heading_slugs: HashSet<&str> = found.iter().map(|h| h.slug.as_str()).collect();

    let mut missing_sections = BTreeSet::new();
    if !found.iter().any(|h| h.level == 1) {
        missing_sections.insert(state.metadata.display_title().to_string());
    }
    for root in state.sections.iter().filter_map(|s| s.root()) {
        if !heading_texts.contains(&normalize(root)) {
            missing_sections.insert(root.to_string());
        }
    }

    let unit_titles: HashSet<String> = state
        .knowledge_items
        .iter()
        .map(|u| normalize(&u.title))
        .collect();
    let mut dangling_references = BTreeSet::new();
    for link in links(md) {
        let Some(anchor) = link.anchor() else {
            continue;
        };
        let text = normalize(&link.text);
        let resolved = heading_slugs.contains(anchor)
            || heading_texts.contains(&text)
            || unit_titles.contains(&text);
        if !resolved {
            let label = if link.text.is_empty() { link.target.clone() } else { link.text.clone() };
            dangling_references.insert(label);
        }
    }

    let terminology_issues = terminology_issues(&prose_text(md));
    let hallucinated_claims = state.hallucinated_claims.clone();

    let passed = missing_sections.is_empty()
        && dangling_references.is_empty()
        && terminology_issues.is_empty()
        && hallucinated_claims.is_empty();

    ValidationReport {
        passed,
        missing_sections,
        dangling_references,
        terminology_issues,
        hallucinated_claims,
        attempt_number: state.revision_count,
    }
}

/// Spelling variants of one term used side by side.
///
/// Flags hyphenated Latin words whose joined form also occurs
/// (`e-mail` / `email`) and katakana words written both with and without
/// a trailing long-vowel mark (`サーバー` / `サーバ`).
pub fn terminology_issues(prose: &str) -> Vec<String> {
    let mut issues = BTreeSet::new();

    let latin: HashSet<String> = LATIN_WORD_RE
        .find_iter(prose)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    for m in HYPHENATED_RE.find_iter(prose) {
        let hyphenated = m.as_str().to_lowercase();
        let joined = hyphenated.replace('-', "");
        if latin.contains(&joined) {
            issues.insert(format!("{hyphenated} / {joined}"));
        }
    }

    let katakana: HashSet<&str> = KATAKANA_RE.find_iter(prose).map(|m| m.as_str()).collect();
    for word in &katakana {
        let stripped = word.trim_end_matches('ー');
        if stripped != *word && stripped.chars().count() >= 2 && katakana.contains(stripped) {
            issues.insert(format!("{word} / {stripped}"));
        }
    }

    issues.into_iter().collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
