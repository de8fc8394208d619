//! The per-document aggregate threaded through the pipeline.

use std::collections::HashSet;

use crate::error::{Html2DocError, Result};
use crate::types::{
    Asset, DocumentMetadata, HallucinatedClaim, KnowledgeUnit, RelationEdge, SectionChunk,
    TokenUsage, ValidationReport,
};

/// Mutable state for one input document.
///
/// Created at pipeline entry and dropped after persistence or terminal
/// failure. Each stage reads the fields produced before it and fills its own.
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub metadata: DocumentMetadata,
    pub html: String,
    pub sections: Vec<SectionChunk>,
    pub assets: Vec<Asset>,
    pub knowledge_items: Vec<KnowledgeUnit>,
    pub relationships: Vec<RelationEdge>,
    /// Empty until the composer has run at least once.
    pub markdown: String,
    /// Claims flagged by the most recent grounding check.
    pub hallucinated_claims: Vec<HallucinatedClaim>,
    /// Most recent validation report; feedback for the next composition.
    pub report: Option<ValidationReport>,
    /// Number of re-compositions performed so far. Never decreases.
    pub revision_count: u32,
    /// Tokens spent on this document across all stages.
    pub usage: TokenUsage,
}

impl DocumentState {
    pub fn new(metadata: DocumentMetadata, html: impl Into<String>) -> Self {
        Self {
            metadata,
            html: html.into(),
            sections: Vec::new(),
            assets: Vec::new(),
            knowledge_items: Vec::new(),
            relationships: Vec::new(),
            markdown: String::new(),
            hallucinated_claims: Vec::new(),
            report: None,
            revision_count: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn section(&self, id: &str) -> Option<&SectionChunk> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn unit(&self, id: &str) -> Option<&KnowledgeUnit> {
        self.knowledge_items.iter().find(|u| u.id == id)
    }

    /// The last report if it failed, i.e. the feedback for a revision.
    pub fn pending_feedback(&self) -> Option<&ValidationReport> {
        self.report.as_ref().filter(|r| !r.passed)
    }

    /// Check the cross-field invariants of the knowledge graph:
    /// every unit traces to an existing section, every asset to an
    /// existing section, and every edge joins two existing units.
    pub fn check_invariants(&self) -> Result<()> {
        let section_ids: HashSet<&str> = self.sections.iter().map(|s| s.id.as_str()).collect();
        let unit_ids: HashSet<&str> = self
            .knowledge_items
            .iter()
            .map(|u| u.id.as_str())
            .collect();

        if let Some(unit) = self
            .knowledge_items
            .iter()
            .find(|u| !section_ids.contains(u.source_section_id.as_str()))
        {
            return Err(Html2DocError::validation(format!(
                "unit {} references unknown section {}",
                unit.id, unit.source_section_id
            )));
        }

        if let Some(asset) = self
            .assets
            .iter()
            .find(|a| !section_ids.contains(a.owning_section_id.as_str()))
        {
            return Err(Html2DocError::validation(format!(
                "asset {} is owned by unknown section {}",
                asset.id, asset.owning_section_id
            )));
        }

        if let Some(edge) = self.relationships.iter().find(|e| {
            e.from_id == e.to_id
                || !unit_ids.contains(e.from_id.as_str())
                || !unit_ids.contains(e.to_id.as_str())
        }) {
            return Err(Html2DocError::validation(format!(
                "edge {} -[{}]-> {} has an invalid endpoint",
                edge.from_id, edge.kind, edge.to_id
            )));
        }

        Ok(())
    }
}
