//! Markdown composition from the knowledge graph.
//!
//! Composition is two steps. [`plan_outline`] fixes the order of units
//! deterministically from categories, ordering edges, and source position;
//! [`render_draft`] turns that order into Markdown. The draft is then
//! polished by one model call, with validation feedback when revising.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use html2doc_llm::LanguageModelClient;
use html2doc_markdown::{normalize_markdown, slugify};
use html2doc_shared::{
    Asset, DocumentState, KnowledgeUnit, RelationEdge, RelationKind, Result, SectionChunk,
};

use crate::orchestrator::Stage;
use crate::prompts;

/// Heading of the generated section that mirrors the source structure.
pub const SOURCE_OUTLINE_HEADING: &str = "Source Outline";

/// Units of one category, in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineGroup {
    pub category: String,
    pub unit_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Order units for rendering.
///
/// Groups appear in order of their first unit in the source. Inside a group,
/// `depends_on` and `follows` edges put the target before the source; ties
/// go to the earlier source position. An edge that would close a cycle is
/// ignored, so earlier edges win and the order always exists.
pub fn plan_outline(
    units: &[KnowledgeUnit],
    edges: &[RelationEdge],
    sections: &[SectionChunk],
) -> Vec<OutlineGroup> {
    let section_order: HashMap<&str, usize> = sections
        .iter()
        .map(|s| (s.id.as_str(), s.order_index))
        .collect();

    let mut indices: Vec<usize> = (0..units.len()).collect();
    indices.sort_by_key(|&i| {
        let order = section_order
            .get(units[i].source_section_id.as_str())
            .copied()
            .unwrap_or(usize::MAX);
        (order, i)
    });

    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for i in indices {
        let category = units[i].category.as_str();
        match groups.iter_mut().find(|(c, _)| *c == category) {
            Some((_, members)) => members.push(i),
            None => groups.push((category, vec![i])),
        }
    }

    groups
        .into_iter()
        .map(|(category, members)| OutlineGroup {
            category: category.to_string(),
            unit_ids: order_group(&members, units, edges)
                .into_iter()
                .map(|i| units[i].id.clone())
                .collect(),
        })
        .collect()
}

/// Topological order of `members` (already in tie-break order).
fn order_group(members: &[usize], units: &[KnowledgeUnit], edges: &[RelationEdge]) -> Vec<usize> {
    let rank: HashMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(r, &i)| (units[i].id.as_str(), r))
        .collect();

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); members.len()];
    let mut indegree = vec![0usize; members.len()];

    for edge in edges.iter().filter(|e| e.kind.is_ordering()) {
        let (Some(&before), Some(&after)) =
            (rank.get(edge.to_id.as_str()), rank.get(edge.from_id.as_str()))
        else {
            continue;
        };
        if before == after || successors[before].contains(&after) {
            continue;
        }
        if reaches(&successors, after, before) {
            debug!(from = %edge.from_id, to = %edge.to_id, kind = %edge.kind, "ignoring edge that closes a cycle");
            continue;
        }
        successors[before].push(after);
        indegree[after] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..members.len())
        .filter(|&r| indegree[r] == 0)
        .map(Reverse)
        .collect();
    let mut ordered = Vec::with_capacity(members.len());
    while let Some(Reverse(r)) = ready.pop() {
        ordered.push(members[r]);
        for &next in &successors[r] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    ordered
}

/// Whether `target` is reachable from `start` over accepted edges.
fn reaches(successors: &[Vec<usize>], start: usize, target: usize) -> bool {
    let mut stack = vec![start];
    let mut visited = vec![false; successors.len()];
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if std::mem::replace(&mut visited[node], true) {
            continue;
        }
        stack.extend(successors[node].iter().copied());
    }
    false
}

// ---------------------------------------------------------------------------
// Draft rendering
// ---------------------------------------------------------------------------

/// Render the deterministic Markdown draft for `state` in `outline` order.
pub fn render_draft(state: &DocumentState, outline: &[OutlineGroup]) -> String {
    let units: HashMap<&str, &KnowledgeUnit> = state
        .knowledge_items
        .iter()
        .map(|u| (u.id.as_str(), u))
        .collect();
    let assets: HashMap<&str, &Asset> = state.assets.iter().map(|a| (a.id.as_str(), a)).collect();

    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", state.metadata.display_title());
    if let Some(context) = state.metadata.context.as_deref().filter(|c| !c.trim().is_empty()) {
        let _ = writeln!(out, "> {}\n", context.trim());
    }

    for group in outline {
        let _ = writeln!(out, "## {}\n", group.category);
        for id in &group.unit_ids {
            if let Some(unit) = units.get(id.as_str()) {
                render_unit(&mut out, unit, &units, &assets, &state.relationships);
            }
        }
    }

    render_source_outline(&mut out, &state.sections, &state.knowledge_items);
    out
}

fn render_unit(
    out: &mut String,
    unit: &KnowledgeUnit,
    units: &HashMap<&str, &KnowledgeUnit>,
    assets: &HashMap<&str, &Asset>,
    edges: &[RelationEdge],
) {
    let _ = writeln!(out, "### {}\n", unit.title);

    if !unit.preconditions.is_empty() {
        out.push_str("**Preconditions**\n\n");
        for condition in &unit.preconditions {
            let _ = writeln!(out, "- {condition}");
        }
        out.push('\n');
    }

    for (n, step) in unit.procedure.iter().enumerate() {
        let _ = writeln!(out, "{}. {step}", n + 1);
    }
    if !unit.procedure.is_empty() {
        out.push('\n');
    }

    let mut related = Vec::new();
    for edge in edges {
        let Some(other) = edge.other_end(&unit.id).and_then(|id| units.get(id)) else {
            continue;
        };
        let label = match edge.kind {
            RelationKind::DependsOn => "Requires",
            RelationKind::Follows => "After",
            RelationKind::DerivesFrom => "Based on",
            RelationKind::Duplicates => "Same as",
        };
        related.push(format!("{label} {}", unit_link(other)));
    }
    for reference in &unit.references {
        if let Some(other) = units.get(reference.as_str()) {
            related.push(format!("See {}", unit_link(other)));
        } else if let Some(asset) = assets.get(reference.as_str()) {
            let description = asset
                .description
                .as_deref()
                .or(asset.alt.as_deref())
                .unwrap_or(&asset.source_ref);
            related.push(format!("Figure: {description}"));
        }
    }

    if !related.is_empty() {
        out.push_str("**Related**\n\n");
        for line in related {
            let _ = writeln!(out, "- {line}");
        }
        out.push('\n');
    }
}

/// `## Source Outline` with every heading root and the units derived from it.
fn render_source_outline(out: &mut String, sections: &[SectionChunk], units: &[KnowledgeUnit]) {
    if sections.iter().all(|s| s.heading_path.is_empty()) {
        return;
    }
    let _ = writeln!(out, "## {SOURCE_OUTLINE_HEADING}\n");

    let mut current_root: Option<&str> = None;
    for section in sections {
        let Some(root) = section.root() else {
            continue;
        };
        if current_root != Some(root) {
            if current_root.is_some() {
                out.push('\n');
            }
            let _ = writeln!(out, "### {root}\n");
            current_root = Some(root);
        }

        let derived: Vec<String> = units
            .iter()
            .filter(|u| u.source_section_id == section.id)
            .map(unit_link)
            .collect();
        if section.heading_path.len() < 2 && derived.is_empty() {
            continue;
        }
        let mut line = format!("- {}", section.heading_path.join(" > "));
        if !derived.is_empty() {
            let _ = write!(line, ": {}", derived.join(", "));
        }
        let _ = writeln!(out, "{line}");
    }
}

fn unit_link(unit: &KnowledgeUnit) -> String {
    format!("[{}](#{})", unit.title, slugify(&unit.title))
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Builds `state.markdown` from the knowledge graph.
pub struct MarkdownComposer {
    client: Arc<dyn LanguageModelClient>,
}

impl MarkdownComposer {
    pub fn new(client: Arc<dyn LanguageModelClient>) -> Self {
        Self { client }
    }

    /// Compose (or recompose) the document.
    ///
    /// A failed report on the state counts as feedback: it is passed to the
    /// model together with the previous output and bumps `revision_count`.
    #[instrument(skip_all, fields(stem = %state.metadata.stem, revision = state.revision_count))]
    pub async fn compose(&self, state: &mut DocumentState) -> Result<()> {
        let feedback = state.pending_feedback().cloned();
        if feedback.is_some() {
            state.revision_count += 1;
        }

        let outline = plan_outline(&state.knowledge_items, &state.relationships, &state.sections);
        let draft = render_draft(state, &outline);

        let previous = feedback
            .as_ref()
            .map(|_| state.markdown.as_str())
            .filter(|m| !m.trim().is_empty());
        let request = prompts::compose_markdown(&state.metadata, &draft, feedback.as_ref(), previous);
        let completion = self.client.complete(request).await?;
        state.usage += completion.usage;

        let body = if completion.text.trim().is_empty() {
            warn!("composer answer was empty; using the draft");
            draft
        } else {
            completion.text
        };
        state.markdown = normalize_markdown(&body);

        info!(
            groups = outline.len(),
            chars = state.markdown.len(),
            revision = state.revision_count,
            "composition complete"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for MarkdownComposer {
    fn name(&self) -> &'static str {
        "composing"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        self.compose(state).await
    }
}
