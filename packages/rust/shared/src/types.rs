//! Knowledge-graph domain types shared by every pipeline stage.
//!
//! The graph is kept as plain data: units live in an id-keyed list and
//! relations are a separate edge list over unit ids. No type holds a
//! reference to another.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for the `<stem>.json` knowledge-graph document.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one batch run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DocumentMetadata
// ---------------------------------------------------------------------------

/// Identity of one input document. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Absolute path of the HTML source.
    pub input_path: PathBuf,
    /// File stem, used for output names and log context.
    pub stem: String,
    /// Optional title override used in prompts and the top heading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional free-text framing (audience, product, etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl DocumentMetadata {
    /// Build metadata for `input_path`, deriving the stem from the file name.
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        let input_path = input_path.into();
        let stem = stem_of(&input_path);
        Self {
            input_path,
            stem,
            title: None,
            context: None,
        }
    }

    /// Set the title override.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the prompt context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Title to display: the override if present, otherwise the stem.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.stem)
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

// ---------------------------------------------------------------------------
// SectionChunk / Asset
// ---------------------------------------------------------------------------

/// One node of the parsed document tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionChunk {
    /// Stable identifier (`sec-<n>`).
    pub id: String,
    /// Headings from the document root down to this node. Empty for
    /// content that precedes the first heading.
    pub heading_path: Vec<String>,
    /// Markdown rendering of the section body. Tables are pipe-delimited.
    pub text: String,
    /// The source HTML the section was built from.
    pub html_fragment: String,
    /// Position in document order, starting at zero.
    pub order_index: usize,
}

impl SectionChunk {
    /// Top-level heading this section lives under.
    pub fn root(&self) -> Option<&str> {
        self.heading_path.first().map(String::as_str)
    }

    /// Nearest heading of this section.
    pub fn heading(&self) -> Option<&str> {
        self.heading_path.last().map(String::as_str)
    }

    /// Render the section for inclusion in a model prompt.
    pub fn to_prompt_fragment(&self) -> String {
        let path = if self.heading_path.is_empty() {
            "(no heading)".to_string()
        } else {
            self.heading_path.join(" > ")
        };
        format!("[{}] {path}\n{}", self.id, self.text.trim())
            .trim()
            .to_string()
    }
}

/// Kind of embedded asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Attachment,
}

/// An image or embedded object owned by exactly one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Stable identifier (`asset-<n>`).
    pub id: String,
    pub kind: AssetKind,
    /// `src` / `data` attribute as written in the HTML.
    pub source_ref: String,
    /// `alt` / `title` text from the HTML, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    /// Textual interpretation, filled during knowledge extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Section that contains the asset.
    pub owning_section_id: String,
}

impl Asset {
    /// Images without a usable description need a model call first.
    pub fn needs_description(&self) -> bool {
        self.kind == AssetKind::Image
            && self
                .description
                .as_deref()
                .is_none_or(|d| d.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// KnowledgeUnit / RelationEdge
// ---------------------------------------------------------------------------

/// A discrete piece of actionable knowledge extracted from one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeUnit {
    /// Stable identifier (`<section_id>-ku-<k>`).
    pub id: String,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub preconditions: BTreeSet<String>,
    #[serde(default)]
    pub procedure: Vec<String>,
    /// Ids of units or assets this unit points at.
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// Section the unit was extracted from (provenance).
    pub source_section_id: String,
}

/// Typed relation between two knowledge units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    DependsOn,
    DerivesFrom,
    Duplicates,
    Follows,
}

impl RelationKind {
    /// Relation name as written in prompts and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependsOn => "depends_on",
            Self::DerivesFrom => "derives_from",
            Self::Duplicates => "duplicates",
            Self::Follows => "follows",
        }
    }

    /// Parse a model-written relation name, tolerating case and separators.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "depends_on" | "requires" | "prerequisite" => Some(Self::DependsOn),
            "derives_from" | "derived_from" => Some(Self::DerivesFrom),
            "duplicates" | "duplicate" | "same_as" => Some(Self::Duplicates),
            "follows" | "next" | "after" => Some(Self::Follows),
            _ => None,
        }
    }

    /// Whether the relation constrains reading order.
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::DependsOn | Self::Follows)
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed edge over `KnowledgeUnit` ids.
///
/// `duplicates` is symmetric: it is stored once with `from_id < to_id`
/// and [`RelationEdge::touches`] treats both directions as equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationEdge {
    pub from_id: String,
    pub to_id: String,
    pub kind: RelationKind,
}

impl RelationEdge {
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            kind,
        }
    }

    /// Canonical representation: symmetric edges are ordered by id.
    pub fn canonical(self) -> Self {
        if self.kind == RelationKind::Duplicates && self.from_id > self.to_id {
            Self {
                from_id: self.to_id,
                to_id: self.from_id,
                kind: self.kind,
            }
        } else {
            self
        }
    }

    /// The endpoint opposite to `id`, following symmetric edges both ways.
    pub fn other_end(&self, id: &str) -> Option<&str> {
        if self.from_id == id {
            Some(&self.to_id)
        } else if self.kind == RelationKind::Duplicates && self.to_id == id {
            Some(&self.from_id)
        } else {
            None
        }
    }

    /// Whether the edge relates `a` and `b` with `kind`.
    pub fn touches(&self, a: &str, b: &str, kind: RelationKind) -> bool {
        if self.kind != kind {
            return false;
        }
        let forward = self.from_id == a && self.to_id == b;
        let backward = self.from_id == b && self.to_id == a;
        forward || (kind == RelationKind::Duplicates && backward)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A generated statement that could not be grounded in the sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HallucinatedClaim {
    /// The unsupported statement, paraphrased.
    pub statement: String,
    /// Verbatim excerpt of the offending Markdown.
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of one validation pass over composed Markdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub missing_sections: BTreeSet<String>,
    #[serde(default)]
    pub dangling_references: BTreeSet<String>,
    #[serde(default)]
    pub terminology_issues: Vec<String>,
    #[serde(default)]
    pub hallucinated_claims: Vec<HallucinatedClaim>,
    /// Revision count at the time of validation (0 = first composition).
    pub attempt_number: u32,
}

impl ValidationReport {
    /// Total number of flagged problems across all categories.
    pub fn issue_count(&self) -> usize {
        self.missing_sections.len()
            + self.dangling_references.len()
            + self.terminology_issues.len()
            + self.hallucinated_claims.len()
    }

    /// One-line description suitable for logs and the run summary.
    pub fn summary(&self) -> String {
        if self.passed {
            return format!("validation passed (attempt {})", self.attempt_number);
        }
        let mut parts = Vec::new();
        if !self.missing_sections.is_empty() {
            parts.push(format!("{} missing section(s)", self.missing_sections.len()));
        }
        if !self.dangling_references.is_empty() {
            parts.push(format!(
                "{} dangling reference(s)",
                self.dangling_references.len()
            ));
        }
        if !self.terminology_issues.is_empty() {
            parts.push(format!(
                "{} terminology issue(s)",
                self.terminology_issues.len()
            ));
        }
        if !self.hallucinated_claims.is_empty() {
            parts.push(format!(
                "{} unsupported claim(s)",
                self.hallucinated_claims.len()
            ));
        }
        format!(
            "validation failed after {} revision(s): {}",
            self.attempt_number,
            parts.join(", ")
        )
    }
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Token counters reported by the model collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, u| {
            acc += u;
            acc
        })
    }
}
