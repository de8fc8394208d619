//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use html2doc_shared::{Html2DocError, ModelConfig, Result, TokenUsage};

use crate::client::{Completion, CompletionRequest, LanguageModelClient};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Longest slice of an error body carried into the error message.
const ERROR_EXCERPT_CHARS: usize = 300;

/// [`LanguageModelClient`] backed by `POST {base_url}/chat/completions`.
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    top_p: Option<f32>,
    max_output_tokens: Option<u32>,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    /// Build a client reading the API key from the env var named in `config`.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                Html2DocError::config(format!(
                    "API key not found. Set the {} environment variable.",
                    config.api_key_env
                ))
            })?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ModelConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Html2DocError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.name.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: request.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: request.user_prompt.clone(),
                },
            ],
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: request.max_output_tokens.or(self.max_output_tokens),
            response_format: request.response_schema.as_ref().map(|schema| {
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": request.task.as_str(),
                        "schema": schema,
                    }
                })
            }),
        }
    }
}

#[async_trait]
impl LanguageModelClient for OpenAiClient {
    #[instrument(skip_all, fields(task = %request.task, model = %self.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = self.build_body(&request);
        let task = request.task;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Html2DocError::ModelCall(format!("{task}: request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Html2DocError::ModelCall(format!(
                "{task}: HTTP {status}: {}",
                excerpt(&body)
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            Html2DocError::ModelCall(format!("{task}: unreadable response body: {e}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Html2DocError::ModelCall(format!("{task}: response had no content")))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        debug!(
            tokens_in = usage.input_tokens,
            tokens_out = usage.output_tokens,
            chars = text.len(),
            "model call complete"
        );

        Ok(Completion { text, usage })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(ERROR_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModelTask;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> ModelConfig {
        ModelConfig {
            name: "test-model".into(),
            base_url: format!("{}/v1", server.uri()),
            max_output_tokens: Some(2048),
            ..Default::default()
        }
    }

    fn ok_body(content: &str) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7}
        })
    }

    #[tokio::test]
    async fn sends_chat_request_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "max_tokens": 2048,
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("hi there")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&config_for(&server), "sk-test").unwrap();
        let completion = client
            .complete(CompletionRequest::new(ModelTask::ComposeMarkdown, "be terse", "hello"))
            .await
            .unwrap();

        assert_eq!(completion.text, "hi there");
        assert_eq!(completion.usage, TokenUsage::new(42, 7));
        assert_eq!(client.model_name(), "test-model");
    }

    #[tokio::test]
    async fn schema_becomes_response_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "max_tokens": 600,
                "response_format": {
                    "type": "json_schema",
                    "json_schema": {"name": "check_grounding"}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("{\"claims\": []}")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&config_for(&server), "sk-test").unwrap();
        let request = CompletionRequest::new(ModelTask::CheckGrounding, "s", "u")
            .with_schema(json!({"type": "object"}))
            .with_max_output_tokens(600);
        let completion = client.complete(request).await.unwrap();
        assert_eq!(completion.text, "{\"claims\": []}");
    }

    #[tokio::test]
    async fn http_error_is_a_fatal_model_call_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&config_for(&server), "sk-test").unwrap();
        let err = client
            .complete(CompletionRequest::new(ModelTask::ExtractKnowledge, "s", "u"))
            .await
            .unwrap_err();

        assert!(matches!(err, Html2DocError::ModelCall(_)));
        assert!(err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("429"), "got: {msg}");
        assert!(msg.contains("rate limit exceeded"));
        assert!(msg.contains("extract_knowledge"));
    }

    #[tokio::test]
    async fn missing_content_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&config_for(&server), "sk-test").unwrap();
        let err = client
            .complete(CompletionRequest::new(ModelTask::LinkRelations, "s", "u"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no content"));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let config = ModelConfig {
            api_key_env: "HTML2DOC_TEST_UNSET_KEY_9341".into(),
            ..Default::default()
        };
        let err = OpenAiClient::from_config(&config).unwrap_err();
        assert!(matches!(err, Html2DocError::Config { .. }));
    }
}
