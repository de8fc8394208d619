//! Relation inference over a document's knowledge units.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use html2doc_llm::{LanguageModelClient, extract_items};
use html2doc_shared::{DocumentState, KnowledgeUnit, RelationEdge, RelationKind, Result};

use crate::orchestrator::Stage;
use crate::prompts;

/// Infers typed edges between knowledge units with one model call.
pub struct RelationLinker {
    client: Arc<dyn LanguageModelClient>,
}

impl RelationLinker {
    pub fn new(client: Arc<dyn LanguageModelClient>) -> Self {
        Self { client }
    }

    /// Replace `state.relationships` with edges inferred from the units.
    ///
    /// Needs at least two units. A malformed answer yields no edges.
    #[instrument(skip_all, fields(stem = %state.metadata.stem, units = state.knowledge_items.len()))]
    pub async fn link(&self, state: &mut DocumentState) -> Result<()> {
        state.relationships.clear();
        if state.knowledge_items.len() < 2 {
            debug!("fewer than two units; nothing to link");
            return Ok(());
        }

        let completion = self
            .client
            .complete(prompts::link_relations(&state.knowledge_items))
            .await?;
        state.usage += completion.usage;

        let items = match extract_items(&completion.text, "relations", FROM_KEYS) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "relation answer malformed; keeping no edges");
                return Ok(());
            }
        };

        let proposed = items.len();
        state.relationships = sanitize_edges(items, &state.knowledge_items);
        info!(
            edges = state.relationships.len(),
            dropped = proposed - state.relationships.len(),
            "linking complete"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for RelationLinker {
    fn name(&self) -> &'static str {
        "linking"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        self.link(state).await
    }
}

/// Keep only well-formed edges between known, distinct units.
///
/// Unknown kinds, unknown endpoints, and self-loops are dropped. Symmetric
/// edges are canonicalized and exact duplicates removed; the first
/// occurrence wins so answer order is preserved.
pub(crate) fn sanitize_edges(items: Vec<Value>, units: &[KnowledgeUnit]) -> Vec<RelationEdge> {
    let known: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut edges = Vec::new();

    for item in items {
        let Some(edge) = edge_from_value(&item) else {
            continue;
        };
        if edge.from_id == edge.to_id
            || !known.contains(edge.from_id.as_str())
            || !known.contains(edge.to_id.as_str())
        {
            debug!(from = %edge.from_id, to = %edge.to_id, "dropping edge with invalid endpoint");
            continue;
        }
        let edge = edge.canonical();
        if seen.insert(edge.clone()) {
            edges.push(edge);
        }
    }
    edges
}

const FROM_KEYS: &[&str] = &["from_id", "source_id", "from"];

fn edge_from_value(value: &Value) -> Option<RelationEdge> {
    let from = str_field(value, FROM_KEYS)?;
    let to = str_field(value, &["to_id", "target_id", "to"])?;
    let kind = RelationKind::parse(str_field(value, &["kind", "relation"])?)?;
    Some(RelationEdge::new(from, to, kind))
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use html2doc_llm::{MockModelClient, ModelTask};
    use html2doc_shared::DocumentMetadata;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn unit(id: &str) -> KnowledgeUnit {
        KnowledgeUnit {
            id: id.into(),
            category: "General".into(),
            title: format!("Title {id}"),
            preconditions: BTreeSet::new(),
            procedure: vec![],
            references: BTreeSet::new(),
            source_section_id: "sec-1".into(),
        }
    }

    #[test]
    fn sanitize_filters_and_canonicalizes() {
        let units = vec![unit("a"), unit("b"), unit("c")];
        let items = vec![
            json!({"from_id": "a", "to_id": "b", "kind": "depends_on"}),
            json!({"from_id": "a", "to_id": "ghost", "kind": "follows"}),
            json!({"from_id": "c", "to_id": "c", "kind": "follows"}),
            json!({"from_id": "c", "to_id": "a", "kind": "duplicates"}),
            json!({"from_id": "a", "to_id": "c", "kind": "duplicate"}),
            json!({"from_id": "b", "to_id": "c", "kind": "contradicts"}),
            json!({"source_id": "b", "target_id": "c", "relation": "follows"}),
            json!({"from_id": "a", "to_id": "b", "kind": "depends_on"}),
            json!("garbage"),
        ];

        let edges = sanitize_edges(items, &units);
        assert_eq!(
            edges,
            vec![
                RelationEdge::new("a", "b", RelationKind::DependsOn),
                RelationEdge::new("a", "c", RelationKind::Duplicates),
                RelationEdge::new("b", "c", RelationKind::Follows),
            ]
        );
    }

    #[tokio::test]
    async fn single_unit_skips_the_model() {
        let client = MockModelClient::new(|_| panic!("should not be called"));
        let linker = RelationLinker::new(Arc::new(client.clone()));
        let mut state = DocumentState::new(DocumentMetadata::new("a.html"), "");
        state.knowledge_items = vec![unit("a")];

        linker.link(&mut state).await.unwrap();
        assert!(state.relationships.is_empty());
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_answer_yields_no_edges() {
        let client = MockModelClient::new(|_| Ok("These units are unrelated.".into()));
        let linker = RelationLinker::new(Arc::new(client.clone()));
        let mut state = DocumentState::new(DocumentMetadata::new("a.html"), "");
        state.knowledge_items = vec![unit("a"), unit("b")];

        linker.link(&mut state).await.unwrap();
        assert!(state.relationships.is_empty());
        assert_eq!(client.calls_for(ModelTask::LinkRelations).len(), 1);
    }

    #[tokio::test]
    async fn edges_are_stored_and_usage_counted() {
        let client = MockModelClient::new(|_| {
            Ok(r#"{"relations": [{"from_id": "b", "to_id": "a", "kind": "follows"}]}"#.into())
        });
        let linker = RelationLinker::new(Arc::new(client));
        let mut state = DocumentState::new(DocumentMetadata::new("a.html"), "");
        state.knowledge_items = vec![unit("a"), unit("b")];

        linker.link(&mut state).await.unwrap();
        assert_eq!(
            state.relationships,
            vec![RelationEdge::new("b", "a", RelationKind::Follows)]
        );
        assert_eq!(state.usage.total(), 15);
    }
}
