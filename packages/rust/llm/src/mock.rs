//! Scripted model client for tests.
//!
//! Answers are produced by a closure over the request, so a test can route
//! on [`ModelTask`] or prompt content. Every request is recorded.
//!
//! ```ignore
//! let client = MockModelClient::new(|req| match req.task {
//!     ModelTask::ExtractKnowledge => Ok(r#"{"units": []}"#.into()),
//!     _ => Ok(String::new()),
//! });
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use html2doc_shared::{Result, TokenUsage};

use crate::client::{Completion, CompletionRequest, LanguageModelClient, ModelTask};

type Responder = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

/// In-memory [`LanguageModelClient`] driven by a closure.
#[derive(Clone)]
pub struct MockModelClient {
    responder: Arc<Responder>,
    calls: Arc<Mutex<Vec<CompletionRequest>>>,
    usage: TokenUsage,
    model: String,
}

impl std::fmt::Debug for MockModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockModelClient")
            .field("model", &self.model)
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl MockModelClient {
    pub fn new(responder: impl Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
            usage: TokenUsage::new(10, 5),
            model: "mock-model".into(),
        }
    }

    /// Usage reported for every call.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// All recorded requests, in call order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded requests for one task.
    pub fn calls_for(&self, task: ModelTask) -> Vec<CompletionRequest> {
        self.calls().into_iter().filter(|c| c.task == task).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl LanguageModelClient for MockModelClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let answer = (self.responder)(&request);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        answer.map(|text| Completion {
            text,
            usage: self.usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
