//! Grounding check of composed Markdown against the source sections.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use html2doc_llm::{LanguageModelClient, extract_items};
use html2doc_shared::{DocumentState, HallucinatedClaim, Html2DocError, Result};

use crate::orchestrator::Stage;
use crate::prompts;

const CHECK_ATTEMPTS: u32 = 2;

/// Asks the model which statements of the Markdown the sources do not support.
pub struct HallucinationChecker {
    client: Arc<dyn LanguageModelClient>,
}

impl HallucinationChecker {
    pub fn new(client: Arc<dyn LanguageModelClient>) -> Self {
        Self { client }
    }

    /// Replace `state.hallucinated_claims` with the claims of this pass.
    #[instrument(skip_all, fields(stem = %state.metadata.stem, revision = state.revision_count))]
    pub async fn check(&self, state: &mut DocumentState) -> Result<()> {
        state.hallucinated_claims.clear();
        if state.markdown.trim().is_empty() {
            debug!("no markdown to check");
            return Ok(());
        }

        let request =
            prompts::check_grounding(&state.markdown, &state.sections, &state.knowledge_items);

        for attempt in 1..=CHECK_ATTEMPTS {
            let completion = self.client.complete(request.clone()).await?;
            state.usage += completion.usage;
            match parse_claims(&completion.text) {
                Ok(claims) => {
                    state.hallucinated_claims = claims;
                    break;
                }
                Err(e) if attempt < CHECK_ATTEMPTS => {
                    debug!(attempt, error = %e, "retrying malformed grounding answer");
                }
                Err(e) => {
                    warn!(error = %e, "grounding answer malformed twice; assuming no claims");
                }
            }
        }

        info!(claims = state.hallucinated_claims.len(), "grounding check complete");
        Ok(())
    }
}

#[async_trait]
impl Stage for HallucinationChecker {
    fn name(&self) -> &'static str {
        "checking"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        self.check(state).await
    }
}

const STATEMENT_KEYS: &[&str] = &["statement", "claim"];

/// Claims from a grounding answer. Items may be objects or bare strings.
pub(crate) fn parse_claims(text: &str) -> Result<Vec<HallucinatedClaim>> {
    let mut claims = Vec::new();
    for item in extract_items(text, "claims", STATEMENT_KEYS)? {
        match item {
            Value::String(statement) => {
                let statement = statement.trim().to_string();
                if !statement.is_empty() {
                    claims.push(HallucinatedClaim {
                        excerpt: statement.clone(),
                        statement,
                        reason: None,
                    });
                }
            }
            Value::Object(map) => {
                let field = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|k| map.get(*k).and_then(Value::as_str))
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                };
                let Some(statement) = field(STATEMENT_KEYS) else {
                    continue;
                };
                claims.push(HallucinatedClaim {
                    excerpt: field(&["excerpt", "quote"]).unwrap_or_else(|| statement.clone()),
                    reason: field(&["reason"]),
                    statement,
                });
            }
            other => {
                return Err(Html2DocError::malformed(format!(
                    "claim must be an object or string, got {other}"
                )));
            }
        }
    }
    Ok(claims)
}
