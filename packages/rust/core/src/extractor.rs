//! Per-section knowledge extraction with bounded fan-out.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use html2doc_llm::{LanguageModelClient, extract_items};
use html2doc_shared::{
    Asset, DocumentMetadata, DocumentState, Html2DocError, KnowledgeUnit, Result, SectionChunk,
    TokenUsage,
};

use crate::orchestrator::Stage;
use crate::prompts;

/// Category used when the model gives none.
pub const DEFAULT_CATEGORY: &str = "General";

/// Attempts per section before a malformed answer counts as "no knowledge".
const EXTRACTION_ATTEMPTS: u32 = 2;

/// Turns sections into knowledge units, one model call per section.
pub struct KnowledgeExtractor {
    client: Arc<dyn LanguageModelClient>,
    concurrency: usize,
}

/// What one section contributed. Merged after every task has joined.
#[derive(Debug)]
struct SectionExtraction {
    order_index: usize,
    assets: Vec<Asset>,
    units: Vec<KnowledgeUnit>,
    usage: TokenUsage,
}

impl KnowledgeExtractor {
    pub fn new(client: Arc<dyn LanguageModelClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    /// Describe undescribed images, then extract units for every section.
    ///
    /// Sections run concurrently. The first fatal error aborts the remaining
    /// tasks of this document and is returned.
    #[instrument(skip_all, fields(stem = %state.metadata.stem, sections = state.sections.len()))]
    pub async fn extract(&self, state: &mut DocumentState) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for section in &state.sections {
            let owned: Vec<Asset> = state
                .assets
                .iter()
                .filter(|a| a.owning_section_id == section.id)
                .cloned()
                .collect();
            let client = Arc::clone(&self.client);
            let metadata = state.metadata.clone();
            let section = section.clone();
            let sem = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| Html2DocError::validation(format!("extraction pool closed: {e}")))?;
                extract_section(client.as_ref(), &metadata, &section, owned).await
            });
        }

        let mut results = Vec::with_capacity(state.sections.len());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| {
                Html2DocError::validation(format!("extraction task did not complete: {e}"))
            });
            match outcome.and_then(|r| r) {
                Ok(extraction) => results.push(extraction),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        merge(state, results);
        info!(
            units = state.knowledge_items.len(),
            described = state.assets.iter().filter(|a| a.description.is_some()).count(),
            "extraction complete"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for KnowledgeExtractor {
    fn name(&self) -> &'static str {
        "extracting"
    }

    async fn run(&self, state: &mut DocumentState) -> Result<()> {
        self.extract(state).await
    }
}

/// Fold per-section results back into the state in document order.
fn merge(state: &mut DocumentState, mut results: Vec<SectionExtraction>) {
    results.sort_by_key(|r| r.order_index);

    let mut described: HashMap<String, Asset> = HashMap::new();
    let mut units = Vec::new();
    for result in results {
        state.usage += result.usage;
        described.extend(result.assets.into_iter().map(|a| (a.id.clone(), a)));
        units.extend(result.units);
    }

    for asset in &mut state.assets {
        if let Some(updated) = described.remove(&asset.id) {
            *asset = updated;
        }
    }
    state.knowledge_items = units;
}

async fn extract_section(
    client: &dyn LanguageModelClient,
    metadata: &DocumentMetadata,
    section: &SectionChunk,
    mut assets: Vec<Asset>,
) -> Result<SectionExtraction> {
    let mut usage = TokenUsage::default();

    for asset in assets.iter_mut().filter(|a| a.needs_description()) {
        let completion = client
            .complete(prompts::describe_asset(metadata, section, asset))
            .await?;
        usage += completion.usage;
        let description = fallback_description(completion.text.trim(), asset);
        debug!(section = %section.id, asset = %asset.id, "asset described");
        asset.description = Some(description);
    }

    let asset_refs: Vec<&Asset> = assets.iter().collect();
    let request = prompts::extract_knowledge(metadata, section, &asset_refs);
    let mut units = Vec::new();

    for attempt in 1..=EXTRACTION_ATTEMPTS {
        let completion = client.complete(request.clone()).await?;
        usage += completion.usage;
        match parse_units(&completion.text, section, &assets) {
            Ok(parsed) => {
                units = parsed;
                break;
            }
            Err(e) if attempt < EXTRACTION_ATTEMPTS => {
                debug!(section = %section.id, attempt, error = %e, "retrying malformed extraction");
            }
            Err(e) => {
                warn!(
                    section = %section.id,
                    error = %e,
                    "extraction answer malformed twice; section yields no units"
                );
            }
        }
    }

    Ok(SectionExtraction {
        order_index: section.order_index,
        assets,
        units,
        usage,
    })
}

fn fallback_description(answer: &str, asset: &Asset) -> String {
    if !answer.is_empty() {
        return answer.to_string();
    }
    asset
        .alt
        .clone()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| format!("Image {}", asset.source_ref))
}

const UNIT_TITLE_KEYS: &[&str] = &["title", "name"];

/// Turn a model answer into units for `section`.
///
/// Ids are always assigned here as `<section>-ku-<k>`; model-supplied ids
/// are ignored. Items without a title are dropped. References are kept only
/// when they name an asset of the section.
pub(crate) fn parse_units(
    text: &str,
    section: &SectionChunk,
    assets: &[Asset],
) -> Result<Vec<KnowledgeUnit>> {
    let items = extract_items(text, "units", UNIT_TITLE_KEYS)?;
    let mut units = Vec::with_capacity(items.len());

    for item in items {
        let Value::Object(map) = item else {
            return Err(Html2DocError::malformed(
                "each unit must be a JSON object",
            ));
        };

        let title = string_field(&map, UNIT_TITLE_KEYS);
        if title.is_empty() {
            continue;
        }
        let category = Some(string_field(&map, &["category"]))
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

        let references: BTreeSet<String> = string_list(&map, &["references"])
            .into_iter()
            .filter(|r| assets.iter().any(|a| &a.id == r))
            .collect();

        units.push(KnowledgeUnit {
            id: format!("{}-ku-{}", section.id, units.len() + 1),
            category,
            title,
            preconditions: string_list(&map, &["preconditions", "prerequisites"])
                .into_iter()
                .collect(),
            procedure: string_list(&map, &["procedure", "steps"]),
            references,
            source_section_id: section.id.clone(),
        });
    }

    Ok(units)
}

fn string_field(map: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// A list of non-empty strings; a bare string counts as a one-item list.
fn string_list(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Vec<String> {
    let Some(value) = keys.iter().find_map(|k| map.get(*k)) else {
        return Vec::new();
    };
    let raw: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use html2doc_llm::{MockModelClient, ModelTask};
    use html2doc_shared::AssetKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn section(id: &str, order_index: usize, text: &str) -> SectionChunk {
        SectionChunk {
            id: id.into(),
            heading_path: vec![format!("Heading {id}")],
            text: text.into(),
            html_fragment: String::new(),
            order_index,
        }
    }

    fn image(id: &str, owner: &str, alt: Option<&str>) -> Asset {
        Asset {
            id: id.into(),
            kind: AssetKind::Image,
            source_ref: format!("{id}.png"),
            alt: alt.map(str::to_string),
            description: None,
            owning_section_id: owner.into(),
        }
    }

    fn state_with(sections: Vec<SectionChunk>, assets: Vec<Asset>) -> DocumentState {
        let mut state = DocumentState::new(DocumentMetadata::new("/m/manual.html"), "<p/>");
        state.sections = sections;
        state.assets = assets;
        state
    }

    #[test]
    fn parse_units_assigns_ids_and_defaults() {
        let sec = section("sec-3", 2, "text");
        let assets = vec![image("asset-1", "sec-3", None)];
        let text = r#"{"units": [
            {"title": "Reset password", "procedure": ["Open settings", "Click reset"],
             "preconditions": ["Logged in"], "references": ["asset-1", "asset-99"], "id": "custom"},
            {"title": "  ", "category": "Ignored"},
            {"title": "Unlock account", "category": "Accounts", "steps": "Call support"}
        ]}"#;

        let units = parse_units(text, &sec, &assets).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "sec-3-ku-1");
        assert_eq!(units[0].category, DEFAULT_CATEGORY);
        assert_eq!(units[0].procedure, vec!["Open settings", "Click reset"]);
        assert!(units[0].references.contains("asset-1"));
        assert!(!units[0].references.contains("asset-99"));
        assert_eq!(units[1].id, "sec-3-ku-2");
        assert_eq!(units[1].category, "Accounts");
        assert_eq!(units[1].procedure, vec!["Call support"]);
        assert!(units.iter().all(|u| u.source_section_id == "sec-3"));
    }

    #[test]
    fn parse_units_rejects_object_without_units() {
        let sec = section("sec-1", 0, "text");
        let err = parse_units(r#"{"result": "none"}"#, &sec, &[]).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(parse_units(r#"{"title": "Only"}"#, &sec, &[]).unwrap().len(), 1);
    }

    #[test]
    fn parse_units_rejects_non_objects() {
        let sec = section("sec-1", 0, "text");
        assert!(parse_units(r#"["just a string"]"#, &sec, &[]).is_err());
        assert!(parse_units("not json", &sec, &[]).is_err());
    }

    #[tokio::test]
    async fn units_are_merged_in_section_order() {
        let client = MockModelClient::new(|req| {
            let title = if req.user_prompt.contains("Section sec-1") {
                "First"
            } else {
                "Second"
            };
            Ok(format!(r#"{{"units": [{{"title": "{title}"}}]}}"#))
        });
        let extractor = KnowledgeExtractor::new(Arc::new(client.clone()), 4);
        let mut state = state_with(
            vec![section("sec-1", 0, "a"), section("sec-2", 1, "b")],
            vec![],
        );

        extractor.extract(&mut state).await.unwrap();

        let titles: Vec<&str> = state.knowledge_items.iter().map(|u| u.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
        assert_eq!(state.usage, TokenUsage::new(20, 10));
        assert!(state.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn image_is_described_before_extraction() {
        let client = MockModelClient::new(|req| match req.task {
            ModelTask::DescribeAsset => Ok("Screenshot of the login form".into()),
            _ => {
                assert!(req.user_prompt.contains("Screenshot of the login form"));
                Ok(r#"{"units": [{"title": "Log in", "references": ["asset-1"]}]}"#.into())
            }
        });
        let extractor = KnowledgeExtractor::new(Arc::new(client.clone()), 2);
        let mut state = state_with(
            vec![section("sec-1", 0, "Log in with your ID.")],
            vec![image("asset-1", "sec-1", None)],
        );

        extractor.extract(&mut state).await.unwrap();

        let tasks: Vec<ModelTask> = client.calls().iter().map(|c| c.task).collect();
        assert_eq!(tasks, vec![ModelTask::DescribeAsset, ModelTask::ExtractKnowledge]);
        assert_eq!(
            state.assets[0].description.as_deref(),
            Some("Screenshot of the login form")
        );
        assert!(state.knowledge_items[0].references.contains("asset-1"));
    }

    #[tokio::test]
    async fn empty_description_falls_back_to_alt_then_source() {
        let client = MockModelClient::new(|req| match req.task {
            ModelTask::DescribeAsset => Ok("   ".into()),
            _ => Ok(r#"{"units": []}"#.into()),
        });
        let extractor = KnowledgeExtractor::new(Arc::new(client), 1);
        let mut state = state_with(
            vec![section("sec-1", 0, "x")],
            vec![
                image("asset-1", "sec-1", Some("Dialog")),
                image("asset-2", "sec-1", None),
            ],
        );

        extractor.extract(&mut state).await.unwrap();
        assert_eq!(state.assets[0].description.as_deref(), Some("Dialog"));
        assert_eq!(state.assets[1].description.as_deref(), Some("Image asset-2.png"));
    }

    #[tokio::test]
    async fn malformed_answer_is_retried_once_then_empty() {
        let client = MockModelClient::new(|_| Ok("I could not find anything useful.".into()));
        let extractor = KnowledgeExtractor::new(Arc::new(client.clone()), 1);
        let mut state = state_with(vec![section("sec-1", 0, "x")], vec![]);

        extractor.extract(&mut state).await.unwrap();
        assert!(state.knowledge_items.is_empty());
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_recovers_from_one_malformed_answer() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let client = MockModelClient::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("{broken".into())
            } else {
                Ok(r#"{"units": [{"title": "Recovered"}]}"#.into())
            }
        });
        let extractor = KnowledgeExtractor::new(Arc::new(client), 1);
        let mut state = state_with(vec![section("sec-1", 0, "x")], vec![]);

        extractor.extract(&mut state).await.unwrap();
        assert_eq!(state.knowledge_items[0].title, "Recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn model_call_error_fails_the_document() {
        let client = MockModelClient::new(|req| {
            if req.user_prompt.contains("Section sec-2") {
                Err(Html2DocError::ModelCall("HTTP 401 Unauthorized".into()))
            } else {
                Ok(r#"{"units": []}"#.into())
            }
        });
        let extractor = KnowledgeExtractor::new(Arc::new(client), 2);
        let mut state = state_with(
            vec![section("sec-1", 0, "a"), section("sec-2", 1, "b")],
            vec![],
        );

        let err = extractor.extract(&mut state).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
