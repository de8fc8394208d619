//! Prompt text and response schemas for every model call.

use serde_json::{Value, json};

use html2doc_llm::{CompletionRequest, ModelTask};
use html2doc_shared::{
    Asset, DocumentMetadata, KnowledgeUnit, SectionChunk, ValidationReport,
};

/// Cap on source text sent with a single prompt.
const MAX_PROMPT_CHARS: usize = 24_000;

/// Output cap for grounding checks.
const GROUNDING_MAX_TOKENS: u32 = 600;

// ---------------------------------------------------------------------------
// Asset description
// ---------------------------------------------------------------------------

const DESCRIBE_ASSET_SYSTEM: &str = "You document images found in operator support manuals. \
Describe what the image most likely shows in one or two sentences, using only the file name, \
alt text, and surrounding section text you are given. Write in the language of the section. \
Answer with the description only.";

pub fn describe_asset(
    metadata: &DocumentMetadata,
    section: &SectionChunk,
    asset: &Asset,
) -> CompletionRequest {
    let mut user = framing(metadata);
    user.push_str(&format!("Image source: {}\n", asset.source_ref));
    if let Some(alt) = &asset.alt {
        user.push_str(&format!("Alt text: {alt}\n"));
    }
    user.push_str("\nSurrounding section:\n");
    user.push_str(&truncate_content(&section.to_prompt_fragment(), 4_000));
    CompletionRequest::new(ModelTask::DescribeAsset, DESCRIBE_ASSET_SYSTEM, user)
}

// ---------------------------------------------------------------------------
// Knowledge extraction
// ---------------------------------------------------------------------------

const EXTRACT_SYSTEM: &str = "You are an editor of call-center operator manuals. \
Read one section and return the knowledge an operator can act on as JSON: \
{\"units\": [{\"category\", \"title\", \"preconditions\", \"procedure\", \"references\"}]}. \
`procedure` lists steps in order; `preconditions` lists what must hold before starting; \
`references` may only contain the asset ids listed with the section. \
Use only facts stated in the section and keep its language. \
Return {\"units\": []} if the section holds nothing actionable.";

pub fn extract_knowledge(
    metadata: &DocumentMetadata,
    section: &SectionChunk,
    assets: &[&Asset],
) -> CompletionRequest {
    let mut user = framing(metadata);
    user.push_str(&format!("Section {}:\n", section.id));
    user.push_str(&truncate_content(&section.to_prompt_fragment(), MAX_PROMPT_CHARS));

    if !assets.is_empty() {
        user.push_str("\n\nAssets in this section:\n");
        for asset in assets {
            let description = asset
                .description
                .as_deref()
                .or(asset.alt.as_deref())
                .unwrap_or("(no description)");
            user.push_str(&format!("- {} ({}): {description}\n", asset.id, asset.source_ref));
        }
    }

    CompletionRequest::new(ModelTask::ExtractKnowledge, EXTRACT_SYSTEM, user)
        .with_schema(units_schema())
}

fn units_schema() -> Value {
    let strings = json!({"type": "array", "items": {"type": "string"}});
    json!({
        "type": "object",
        "properties": {
            "units": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "category": {"type": "string"},
                        "title": {"type": "string"},
                        "preconditions": strings,
                        "procedure": strings,
                        "references": strings,
                    },
                    "required": ["category", "title", "preconditions", "procedure", "references"],
                    "additionalProperties": false,
                }
            }
        },
        "required": ["units"],
        "additionalProperties": false,
    })
}

// ---------------------------------------------------------------------------
// Relation linking
// ---------------------------------------------------------------------------

const LINK_SYSTEM: &str = "You build knowledge graphs from operator manuals. \
Given knowledge units, return meaningful relations between them as JSON: \
{\"relations\": [{\"from_id\", \"to_id\", \"kind\"}]}. \
`kind` is one of depends_on (from needs to first), follows (from comes after to), \
derives_from (from is a variant of to), duplicates (same knowledge). \
Use only the ids given. Return {\"relations\": []} when none apply.";

pub fn link_relations(units: &[KnowledgeUnit]) -> CompletionRequest {
    let listing: Vec<Value> = units
        .iter()
        .map(|u| {
            json!({
                "id": u.id,
                "category": u.category,
                "title": u.title,
                "preconditions": u.preconditions,
                "procedure": u.procedure,
            })
        })
        .collect();
    let user = format!(
        "Knowledge units:\n{}",
        truncate_content(
            &serde_json::to_string_pretty(&listing).unwrap_or_default(),
            MAX_PROMPT_CHARS
        )
    );

    CompletionRequest::new(ModelTask::LinkRelations, LINK_SYSTEM, user).with_schema(json!({
        "type": "object",
        "properties": {
            "relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from_id": {"type": "string"},
                        "to_id": {"type": "string"},
                        "kind": {"type": "string", "enum": ["depends_on", "derives_from", "duplicates", "follows"]},
                    },
                    "required": ["from_id", "to_id", "kind"],
                    "additionalProperties": false,
                }
            }
        },
        "required": ["relations"],
        "additionalProperties": false,
    }))
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

const COMPOSE_SYSTEM: &str = "You edit Markdown manuals for call-center operators. \
You receive a draft generated from extracted knowledge. Improve its wording so an operator \
can follow it, but keep every heading, keep every link and its target, keep the numbered \
steps in order, and do not add facts that are not in the draft. \
Answer with the complete Markdown document only.";

pub fn compose_markdown(
    metadata: &DocumentMetadata,
    draft: &str,
    feedback: Option<&ValidationReport>,
    previous: Option<&str>,
) -> CompletionRequest {
    let mut user = framing(metadata);
    user.push_str("Draft:\n\n");
    user.push_str(draft);

    if let Some(report) = feedback {
        if let Some(previous) = previous {
            user.push_str("\n\nPrevious version:\n\n");
            user.push_str(&truncate_content(previous, MAX_PROMPT_CHARS));
        }
        user.push_str("\n\n");
        user.push_str(&feedback_block(report));
    }

    CompletionRequest::new(ModelTask::ComposeMarkdown, COMPOSE_SYSTEM, user)
}

/// Corrective instructions derived from a failed validation.
pub fn feedback_block(report: &ValidationReport) -> String {
    let mut lines = vec![format!(
        "The previous version failed validation (attempt {}). Fix these problems:",
        report.attempt_number
    )];
    for heading in &report.missing_sections {
        lines.push(format!("- Add a heading named \"{heading}\"."));
    }
    for link in &report.dangling_references {
        lines.push(format!(
            "- The link \"{link}\" points at nothing; link to an existing heading or remove it."
        ));
    }
    for claim in &report.hallucinated_claims {
        let mut line = format!(
            "- Remove the unsupported statement \"{}\" (text: \"{}\")",
            claim.statement, claim.excerpt
        );
        if let Some(reason) = &claim.reason {
            line.push_str(&format!(": {reason}"));
        }
        lines.push(line);
    }
    for issue in &report.terminology_issues {
        lines.push(format!("- Use one spelling consistently: {issue}."));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Grounding check
// ---------------------------------------------------------------------------

const GROUNDING_SYSTEM: &str = "You are a quality inspector for operator manuals. \
Compare the generated Markdown with the source sections and extracted knowledge. \
List every statement in the Markdown that the sources do not support or that contradicts them, as JSON: \
{\"claims\": [{\"statement\", \"excerpt\", \"reason\"}]}, where `excerpt` is copied verbatim \
from the Markdown. Return {\"claims\": []} when everything is supported.";

pub fn check_grounding(
    markdown: &str,
    sections: &[SectionChunk],
    units: &[KnowledgeUnit],
) -> CompletionRequest {
    let sources = sections
        .iter()
        .map(SectionChunk::to_prompt_fragment)
        .collect::<Vec<_>>()
        .join("\n\n");
    let knowledge = units
        .iter()
        .map(|u| {
            let mut line = format!("[{}] {} / {}", u.id, u.category, u.title);
            for condition in &u.preconditions {
                line.push_str(&format!("\n  requires: {condition}"));
            }
            for step in &u.procedure {
                line.push_str(&format!("\n  - {step}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "### Source sections\n{}\n\n### Extracted knowledge\n{}\n\n### Generated Markdown\n{}",
        truncate_content(&sources, MAX_PROMPT_CHARS),
        truncate_content(&knowledge, MAX_PROMPT_CHARS / 2),
        markdown
    );

    CompletionRequest::new(ModelTask::CheckGrounding, GROUNDING_SYSTEM, user)
        .with_max_output_tokens(GROUNDING_MAX_TOKENS)
        .with_schema(json!({
            "type": "object",
            "properties": {
                "claims": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "statement": {"type": "string"},
                            "excerpt": {"type": "string"},
                            "reason": {"type": "string"},
                        },
                        "required": ["statement", "excerpt", "reason"],
                        "additionalProperties": false,
                    }
                }
            },
            "required": ["claims"],
            "additionalProperties": false,
        }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Document title and context lines that open every user prompt.
fn framing(metadata: &DocumentMetadata) -> String {
    let mut out = format!("Document: {}\n", metadata.display_title());
    if let Some(context) = metadata.context.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str(&format!("Context: {context}\n"));
    }
    out.push('\n');
    out
}

/// Truncate to about `max_chars` characters on a char boundary.
pub(crate) fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((idx, _)) => {
            format!("{}\n\n[... truncated for the model context window ...]", &content[..idx])
        }
    }
}
