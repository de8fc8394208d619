//! The language model port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use html2doc_shared::{Result, TokenUsage};

/// Which pipeline step issued a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    DescribeAsset,
    ExtractKnowledge,
    LinkRelations,
    ComposeMarkdown,
    CheckGrounding,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DescribeAsset => "describe_asset",
            Self::ExtractKnowledge => "extract_knowledge",
            Self::LinkRelations => "link_relations",
            Self::ComposeMarkdown => "compose_markdown",
            Self::CheckGrounding => "check_grounding",
        }
    }
}

impl std::fmt::Display for ModelTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to the model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub task: ModelTask,
    pub system_prompt: String,
    pub user_prompt: String,
    /// JSON Schema the answer must follow. `None` asks for free text.
    pub response_schema: Option<Value>,
    /// Per-call cap that overrides the configured output limit.
    pub max_output_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(
        task: ModelTask,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            task,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            response_schema: None,
            max_output_tokens: None,
        }
    }

    /// Require a structured answer matching `schema`.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }
}

/// A model answer and what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Capability to run one completion against a language model.
///
/// Transport, auth, and rate-limit failures surface as
/// [`Html2DocError::ModelCall`](html2doc_shared::Html2DocError::ModelCall).
/// Implementations do not retry.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;

    /// Model identifier recorded in output artifacts.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_are_snake_case() {
        assert_eq!(ModelTask::ExtractKnowledge.as_str(), "extract_knowledge");
        assert_eq!(
            serde_json::to_value(ModelTask::CheckGrounding).unwrap(),
            Value::String("check_grounding".into())
        );
    }

    #[test]
    fn request_builder_sets_optional_fields() {
        let req = CompletionRequest::new(ModelTask::LinkRelations, "sys", "user")
            .with_schema(serde_json::json!({"type": "object"}))
            .with_max_output_tokens(600);
        assert!(req.response_schema.is_some());
        assert_eq!(req.max_output_tokens, Some(600));
    }
}
