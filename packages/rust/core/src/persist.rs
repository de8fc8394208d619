//! Writing the two artifacts of a document: Markdown and the knowledge graph.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use html2doc_shared::{
    Asset, CURRENT_SCHEMA_VERSION, DocumentState, Html2DocError, KnowledgeUnit, RelationEdge,
    ResolvedDocument, Result, RunId, SectionChunk, TokenUsage, ValidationReport,
};

use crate::orchestrator::DocumentStatus;

/// Provenance block of the knowledge-graph document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub input_path: PathBuf,
    pub stem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// SHA-256 of the source HTML.
    pub source_sha256: String,
}

/// Contents of `<stem>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeGraphDocument {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub run_id: RunId,
    pub model: String,
    pub status: DocumentStatus,
    pub metadata: GraphMetadata,
    pub sections: Vec<SectionChunk>,
    pub assets: Vec<Asset>,
    pub knowledge_items: Vec<KnowledgeUnit>,
    pub relationships: Vec<RelationEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ValidationReport>,
    pub revision_count: u32,
    pub usage: TokenUsage,
}

impl KnowledgeGraphDocument {
    pub fn from_state(
        state: &DocumentState,
        run_id: &RunId,
        model: &str,
        status: DocumentStatus,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            generated_at: Utc::now(),
            run_id: run_id.clone(),
            model: model.to_string(),
            status,
            metadata: GraphMetadata {
                input_path: state.metadata.input_path.clone(),
                stem: state.metadata.stem.clone(),
                title: state.metadata.title.clone(),
                context: state.metadata.context.clone(),
                source_sha256: sha256_hex(&state.html),
            },
            sections: state.sections.clone(),
            assets: state.assets.clone(),
            knowledge_items: state.knowledge_items.clone(),
            relationships: state.relationships.clone(),
            report: state.report.clone(),
            revision_count: state.revision_count,
            usage: state.usage,
        }
    }
}

/// Where a document's artifacts ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedPaths {
    pub markdown: PathBuf,
    pub graph: PathBuf,
}

/// Storage seam for finished documents.
pub trait Persister: Send + Sync {
    fn persist(
        &self,
        target: &ResolvedDocument,
        markdown: &str,
        graph: &KnowledgeGraphDocument,
    ) -> Result<PersistedPaths>;
}

/// Writes artifacts to the local filesystem, each via temp file and rename.
#[derive(Debug, Default, Clone)]
pub struct FsPersister;

impl Persister for FsPersister {
    #[instrument(skip_all, fields(stem = %target.metadata.stem))]
    fn persist(
        &self,
        target: &ResolvedDocument,
        markdown: &str,
        graph: &KnowledgeGraphDocument,
    ) -> Result<PersistedPaths> {
        write_atomic(&target.output_md, markdown.as_bytes())?;

        let json = serde_json::to_string_pretty(graph)
            .map_err(|e| Html2DocError::Serialization(format!("knowledge graph: {e}")))?;
        write_atomic(&target.output_json, json.as_bytes())?;

        info!(
            markdown = %target.output_md.display(),
            graph = %target.output_json.display(),
            "artifacts written"
        );
        Ok(PersistedPaths {
            markdown: target.output_md.clone(),
            graph: target.output_json.clone(),
        })
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir).map_err(|e| Html2DocError::io(dir, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Html2DocError::validation(format!("{} has no file name", path.display())))?;
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&temp, contents).map_err(|e| Html2DocError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| Html2DocError::io(path, e))?;

    debug!(path = %path.display(), size = contents.len(), "wrote file");
    Ok(())
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
