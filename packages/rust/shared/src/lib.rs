//! Shared types, error model, and configuration for html2doc.
//!
//! This crate is the foundation depended on by all other html2doc crates.
//! It provides:
//! - [`Html2DocError`], the unified error type
//! - The knowledge-graph model ([`SectionChunk`], [`Asset`], [`KnowledgeUnit`],
//!   [`RelationEdge`], [`ValidationReport`]) and the per-document [`DocumentState`]
//! - Run configuration ([`RunConfig`], config and input-list loading)

pub mod config;
pub mod error;
pub mod state;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    FileConfig, ModelConfig, OutputConfig, PipelineConfig, ResolvedDocument, RunConfig,
    ensure_unique_output_paths, graph_target, load_input_list, load_run_config, output_target,
    validate_api_key,
};
pub use error::{Html2DocError, Result};
pub use state::DocumentState;
pub use types::{
    Asset, AssetKind, CURRENT_SCHEMA_VERSION, DocumentMetadata, HallucinatedClaim,
    KnowledgeUnit, RelationEdge, RelationKind, RunId, SectionChunk, TokenUsage,
    ValidationReport,
};
