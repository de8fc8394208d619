//! Per-document state machine.
//!
//! ```text
//! Parsing -> Extracting -> Linking -> Composing -> Checking -> Validating
//!                                        ^                         |
//!                                        +------- Revising <-------+--> Done | Failed
//! ```
//!
//! `Revising -> Composing` is the only backward transition. The number of
//! revisions is bounded by `PipelineConfig::max_revisions`, shared between
//! structural and grounding feedback.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use html2doc_llm::LanguageModelClient;
use html2doc_markdown::parse_sections;
use html2doc_shared::{DocumentState, Html2DocError, PipelineConfig, Result};

use crate::checker::HallucinationChecker;
use crate::composer::MarkdownComposer;
use crate::extractor::KnowledgeExtractor;
use crate::linker::RelationLinker;
use crate::validator::OutputValidator;

// ---------------------------------------------------------------------------
// Stage seam
// ---------------------------------------------------------------------------

/// One step of the pipeline. Each stage reads what earlier stages stored on
/// the state and writes its own fields.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    async fn run(&self, state: &mut DocumentState) -> Result<()>;
}

/// Splits the raw HTML into sections and assets.
#[derive(Debug, Default)]
pub struct ParseStage;

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> &'static str {
        "parsing"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        let (sections, assets) = parse_sections(&state.html, &state.metadata)?;
        state.sections = sections;
        state.assets = assets;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phases and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelinePhase {
    Parsing,
    Extracting,
    Linking,
    Composing,
    Checking,
    Validating,
    Revising,
    Done,
    Failed,
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Final outcome of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Success,
    Failure,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

/// A fatal error, tagged with the document and the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stem}: {stage} failed: {source}")]
pub struct PipelineError {
    pub stem: String,
    pub stage: &'static str,
    #[source]
    pub source: Html2DocError,
}

/// Decide where to go once a report exists.
///
/// `revisions` is the number of revisions the state machine has already
/// scheduled, not a count kept by any stage.
pub fn after_validation(state: &DocumentState, revisions: u32, max_revisions: u32) -> PipelinePhase {
    match &state.report {
        Some(report) if report.passed => PipelinePhase::Done,
        _ if revisions < max_revisions => PipelinePhase::Revising,
        _ => PipelinePhase::Failed,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one [`DocumentState`] through every stage.
pub struct PipelineOrchestrator {
    parser: Arc<dyn Stage>,
    extractor: Arc<dyn Stage>,
    linker: Arc<dyn Stage>,
    composer: Arc<dyn Stage>,
    checker: Arc<dyn Stage>,
    validator: Arc<dyn Stage>,
    max_revisions: u32,
}

impl PipelineOrchestrator {
    pub fn new(client: Arc<dyn LanguageModelClient>, config: &PipelineConfig) -> Self {
        Self {
            parser: Arc::new(ParseStage),
            extractor: Arc::new(KnowledgeExtractor::new(
                Arc::clone(&client),
                config.section_concurrency,
            )),
            linker: Arc::new(RelationLinker::new(Arc::clone(&client))),
            composer: Arc::new(MarkdownComposer::new(Arc::clone(&client))),
            checker: Arc::new(HallucinationChecker::new(client)),
            validator: Arc::new(OutputValidator::new()),
            max_revisions: config.max_revisions,
        }
    }

    /// Replace the stage run in `phase`. Phases without a stage are ignored.
    pub fn with_stage(mut self, phase: PipelinePhase, stage: Arc<dyn Stage>) -> Self {
        let slot = match phase {
            PipelinePhase::Parsing => &mut self.parser,
            PipelinePhase::Extracting => &mut self.extractor,
            PipelinePhase::Linking => &mut self.linker,
            PipelinePhase::Composing => &mut self.composer,
            PipelinePhase::Checking => &mut self.checker,
            PipelinePhase::Validating => &mut self.validator,
            PipelinePhase::Revising | PipelinePhase::Done | PipelinePhase::Failed => {
                warn!(?phase, "phase has no stage to replace");
                return self;
            }
        };
        *slot = stage;
        self
    }

    pub fn max_revisions(&self) -> u32 {
        self.max_revisions
    }

    /// Run the state machine to a terminal phase.
    ///
    /// `Ok(Failure)` means the revision bound was reached; the state still
    /// holds the last composition and report. Any stage error is fatal for
    /// the document and returned as [`PipelineError`].
    #[instrument(skip_all, fields(stem = %state.metadata.stem))]
    pub async fn run(
        &self,
        state: &mut DocumentState,
    ) -> std::result::Result<DocumentStatus, PipelineError> {
        let mut phase = PipelinePhase::Parsing;
        let mut revisions = 0u32;

        loop {
            let next = match phase {
                PipelinePhase::Parsing => {
                    self.step(self.parser.as_ref(), state).await?;
                    PipelinePhase::Extracting
                }
                PipelinePhase::Extracting => {
                    self.step(self.extractor.as_ref(), state).await?;
                    PipelinePhase::Linking
                }
                PipelinePhase::Linking => {
                    self.step(self.linker.as_ref(), state).await?;
                    state
                        .check_invariants()
                        .map_err(|e| fatal(state, self.linker.name(), e))?;
                    PipelinePhase::Composing
                }
                PipelinePhase::Composing => {
                    self.step(self.composer.as_ref(), state).await?;
                    if state.revision_count != revisions {
                        warn!(
                            stage = self.composer.name(),
                            reported = state.revision_count,
                            revisions,
                            "composer left an inconsistent revision count"
                        );
                        state.revision_count = revisions;
                    }
                    PipelinePhase::Checking
                }
                PipelinePhase::Checking => {
                    self.step(self.checker.as_ref(), state).await?;
                    PipelinePhase::Validating
                }
                PipelinePhase::Validating => {
                    self.step(self.validator.as_ref(), state).await?;
                    after_validation(state, revisions, self.max_revisions)
                }
                PipelinePhase::Revising => {
                    let summary = state
                        .report
                        .as_ref()
                        .map(|r| r.summary())
                        .unwrap_or_default();
                    revisions += 1;
                    info!(revision = revisions, %summary, "revising composition");
                    PipelinePhase::Composing
                }
                PipelinePhase::Done => {
                    info!(revisions = state.revision_count, "document complete");
                    return Ok(DocumentStatus::Success);
                }
                PipelinePhase::Failed => {
                    warn!(
                        revisions = state.revision_count,
                        "validation still failing after the revision limit"
                    );
                    return Ok(DocumentStatus::Failure);
                }
            };
            debug!(from = ?phase, to = ?next, "phase transition");
            phase = next;
        }
    }

    async fn step(
        &self,
        stage: &dyn Stage,
        state: &mut DocumentState,
    ) -> std::result::Result<(), PipelineError> {
        stage
            .run(state)
            .await
            .map_err(|e| fatal(state, stage.name(), e))
    }
}

fn fatal(state: &DocumentState, stage: &'static str, source: Html2DocError) -> PipelineError {
    PipelineError {
        stem: state.metadata.stem.clone(),
        stage,
        source,
    }
}
