//! Per-document pipeline and batch runner for html2doc.
//!
//! A document moves through parsing, extraction, linking, composition,
//! grounding check, and validation, looping back to composition while
//! validation fails and revisions remain. [`run_batch`] applies the
//! pipeline to many documents and writes their artifacts.

pub mod checker;
pub mod composer;
pub mod extractor;
pub mod linker;
pub mod orchestrator;
pub mod persist;
pub mod prompts;
pub mod runner;
pub mod validator;

pub use checker::HallucinationChecker;
pub use composer::{MarkdownComposer, OutlineGroup, plan_outline, render_draft};
pub use extractor::KnowledgeExtractor;
pub use linker::RelationLinker;
pub use orchestrator::{
    DocumentStatus, ParseStage, PipelineError, PipelineOrchestrator, PipelinePhase, Stage,
};
pub use persist::{FsPersister, KnowledgeGraphDocument, PersistedPaths, Persister};
pub use runner::{DocumentResult, ProgressReporter, RunSummary, SilentProgress, run_batch};
pub use validator::OutputValidator;
