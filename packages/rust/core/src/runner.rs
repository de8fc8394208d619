//! Batch execution: many documents, bounded concurrency, one summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use html2doc_llm::LanguageModelClient;
use html2doc_shared::{DocumentState, PipelineConfig, ResolvedDocument, RunId, TokenUsage};

use crate::orchestrator::{DocumentStatus, PipelineOrchestrator};
use crate::persist::{KnowledgeGraphDocument, Persister};

/// Progress callbacks for a batch run.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any document starts.
    fn batch_started(&self, total: usize);
    /// Called as each document reaches a final status.
    fn document_finished(&self, result: &DocumentResult, finished: usize, total: usize);
    /// Called once after every document has finished.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn batch_started(&self, _total: usize) {}
    fn document_finished(&self, _result: &DocumentResult, _finished: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// Outcome of one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub stem: String,
    pub input_path: PathBuf,
    pub status: DocumentStatus,
    /// Set whenever the Markdown was written, including exhausted revisions.
    pub output_md_path: Option<PathBuf>,
    pub output_json_path: Option<PathBuf>,
    pub error_message: Option<String>,
    /// Compositions performed (0 if the document never reached composing).
    pub attempts: u32,
    pub usage: TokenUsage,
}

impl DocumentResult {
    fn failed(document: &ResolvedDocument, message: impl Into<String>) -> Self {
        Self {
            stem: document.metadata.stem.clone(),
            input_path: document.metadata.input_path.clone(),
            status: DocumentStatus::Failure,
            output_md_path: None,
            output_json_path: None,
            error_message: Some(message.into()),
            attempts: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DocumentStatus::Success
    }
}

/// Aggregate of a batch run. Results are in input order.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub succeeded: usize,
    pub failed: usize,
    pub usage: TokenUsage,
    pub results: Vec<DocumentResult>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Process every document and collect one result per input.
///
/// A document failure never stops the others. Artifacts are written for
/// successes and for documents that ran out of revisions; fatal errors
/// leave no output behind.
#[instrument(skip_all, fields(documents = documents.len()))]
pub async fn run_batch(
    documents: Vec<ResolvedDocument>,
    client: Arc<dyn LanguageModelClient>,
    persister: Arc<dyn Persister>,
    config: &PipelineConfig,
    progress: &dyn ProgressReporter,
) -> RunSummary {
    let start = Instant::now();
    let run_id = RunId::new();
    let total = documents.len();
    info!(%run_id, total, model = client.model_name(), "starting batch");
    progress.batch_started(total);

    let orchestrator = Arc::new(PipelineOrchestrator::new(Arc::clone(&client), config));
    let semaphore = Arc::new(Semaphore::new(config.document_concurrency.max(1)));
    let mut results: Vec<DocumentResult> = documents
        .iter()
        .map(|d| DocumentResult::failed(d, "document did not finish"))
        .collect();

    let mut tasks = JoinSet::new();
    for (index, document) in documents.into_iter().enumerate() {
        let orchestrator = Arc::clone(&orchestrator);
        let persister = Arc::clone(&persister);
        let semaphore = Arc::clone(&semaphore);
        let model = client.model_name().to_string();
        let run_id = run_id.clone();

        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    process_document(&document, &orchestrator, persister.as_ref(), &run_id, &model)
                        .await
                }
                Err(e) => DocumentResult::failed(&document, format!("document pool closed: {e}")),
            };
            (index, result)
        });
    }

    let mut finished = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                finished += 1;
                progress.document_finished(&result, finished, total);
                results[index] = result;
            }
            Err(e) => error!(error = %e, "document task panicked"),
        }
    }

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let summary = RunSummary {
        run_id,
        succeeded,
        failed: results.len() - succeeded,
        usage: results.iter().map(|r| r.usage).sum(),
        results,
    };

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        tokens = summary.usage.total(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "batch complete"
    );
    progress.done(&summary);
    summary
}

async fn process_document(
    document: &ResolvedDocument,
    orchestrator: &PipelineOrchestrator,
    persister: &dyn Persister,
    run_id: &RunId,
    model: &str,
) -> DocumentResult {
    let input = &document.metadata.input_path;
    let html = match tokio::fs::read_to_string(input).await {
        Ok(html) => html,
        Err(e) => {
            warn!(path = %input.display(), error = %e, "cannot read input");
            return DocumentResult::failed(document, format!("cannot read {}: {e}", input.display()));
        }
    };

    let mut state = DocumentState::new(document.metadata.clone(), html);
    let outcome = orchestrator.run(&mut state).await;
    let attempts = if state.markdown.is_empty() { 0 } else { state.revision_count + 1 };

    let status = match outcome {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "document failed");
            let mut result = DocumentResult::failed(document, e.to_string());
            result.attempts = attempts;
            result.usage = state.usage;
            return result;
        }
    };

    let graph = KnowledgeGraphDocument::from_state(&state, run_id, model, status);
    let mut result = DocumentResult {
        stem: document.metadata.stem.clone(),
        input_path: input.clone(),
        status,
        output_md_path: None,
        output_json_path: None,
        error_message: None,
        attempts,
        usage: state.usage,
    };

    match persister.persist(document, &state.markdown, &graph) {
        Ok(paths) => {
            result.output_md_path = Some(paths.markdown);
            result.output_json_path = Some(paths.graph);
        }
        Err(e) => {
            error!(error = %e, "cannot write artifacts");
            result.status = DocumentStatus::Failure;
            result.error_message = Some(e.to_string());
            return result;
        }
    }

    if status == DocumentStatus::Failure {
        result.error_message = state.report.as_ref().map(|r| r.summary());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistedPaths;
    use html2doc_llm::{MockModelClient, ModelTask};
    use html2doc_shared::{DocumentMetadata, Html2DocError, Result};
    use std::sync::Mutex;

    /// Records persisted stems without touching the filesystem.
    #[derive(Default)]
    struct RecordingPersister {
        stems: Mutex<Vec<String>>,
    }

    impl Persister for RecordingPersister {
        fn persist(
            &self,
            target: &ResolvedDocument,
            _markdown: &str,
            _graph: &KnowledgeGraphDocument,
        ) -> Result<PersistedPaths> {
            self.stems
                .lock()
                .unwrap()
                .push(target.metadata.stem.clone());
            Ok(PersistedPaths {
                markdown: target.output_md.clone(),
                graph: target.output_json.clone(),
            })
        }
    }

    fn document(dir: &std::path::Path, name: &str, html: Option<&str>) -> ResolvedDocument {
        let input = dir.join(format!("{name}.html"));
        if let Some(html) = html {
            std::fs::write(&input, html).unwrap();
        }
        ResolvedDocument {
            metadata: DocumentMetadata::new(&input),
            output_md: dir.join(format!("out/{name}.md")),
            output_json: dir.join(format!("out/{name}.json")),
        }
    }

    fn passing_client() -> MockModelClient {
        MockModelClient::new(|req| match req.task {
            ModelTask::ExtractKnowledge => Ok(r#"{"units": []}"#.into()),
            ModelTask::ComposeMarkdown => {
                let title = req
                    .user_prompt
                    .lines()
                    .find_map(|l| l.strip_prefix("Document: "))
                    .unwrap_or_default()
                    .to_string();
                Ok(format!("# {title}\n\n## Intro\n"))
            }
            ModelTask::CheckGrounding => Ok(r#"{"claims": []}"#.into()),
            _ => Ok(String::new()),
        })
    }

    #[tokio::test]
    async fn one_bad_document_does_not_stop_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let documents = vec![
            document(tmp.path(), "good", Some("<h2>Intro</h2><p>Hello</p>")),
            document(tmp.path(), "missing", None),
            document(tmp.path(), "blank", Some("  ")),
        ];
        let persister = Arc::new(RecordingPersister::default());

        let summary = run_batch(
            documents,
            Arc::new(passing_client()),
            persister.clone(),
            &PipelineConfig::default(),
            &SilentProgress,
        )
        .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert!(summary.has_failures());
        let stems: Vec<_> = summary.results.iter().map(|r| r.stem.as_str()).collect();
        assert_eq!(stems, vec!["good", "missing", "blank"]);
        assert_eq!(summary.results[0].attempts, 1);
        assert!(summary.results[1].error_message.as_deref().unwrap().contains("cannot read"));
        assert!(summary.results[2].error_message.as_deref().unwrap().contains("parsing failed"));
        assert_eq!(*persister.stems.lock().unwrap(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn model_errors_fail_only_their_document() {
        let tmp = tempfile::tempdir().unwrap();
        let documents = vec![
            document(tmp.path(), "a", Some("<h2>Intro</h2><p>Alpha</p>")),
            document(tmp.path(), "b", Some("<h2>Intro</h2><p>Beta</p>")),
        ];
        let client = MockModelClient::new(|req| {
            if req.task == ModelTask::ExtractKnowledge && req.user_prompt.contains("Beta") {
                return Err(Html2DocError::ModelCall("rate limited".into()));
            }
            passing_client_answer(req)
        });

        let summary = run_batch(
            documents,
            Arc::new(client),
            Arc::new(RecordingPersister::default()),
            &PipelineConfig::default(),
            &SilentProgress,
        )
        .await;

        assert!(summary.results[0].is_success());
        assert!(!summary.results[1].is_success());
        assert!(summary.results[1].error_message.as_deref().unwrap().contains("rate limited"));
        assert!(summary.results[1].output_md_path.is_none());
    }

    fn passing_client_answer(req: &html2doc_llm::CompletionRequest) -> Result<String> {
        match req.task {
            ModelTask::ExtractKnowledge => Ok(r#"{"units": []}"#.into()),
            ModelTask::ComposeMarkdown => Ok("# a\n\n## Intro\n".into()),
            ModelTask::CheckGrounding => Ok(r#"{"claims": []}"#.into()),
            _ => Ok(String::new()),
        }
    }
}
