//! Run configuration for html2doc.
//!
//! A run config file (YAML or TOML, chosen by extension) lists the HTML
//! documents to convert plus model and pipeline settings. CLI flags override
//! config file values, which override defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Html2DocError, Result};
use crate::types::DocumentMetadata;

/// Env var consulted for the default model name.
const MODEL_ENV: &str = "HTML2DOC_MODEL";

// ---------------------------------------------------------------------------
// Config structs (matching the run config schema)
// ---------------------------------------------------------------------------

/// Top-level run config, deserialized from YAML or TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Language model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Where artifacts are written.
    #[serde(default)]
    pub output: OutputConfig,

    /// Pipeline bounds and concurrency.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Documents to convert.
    #[serde(default)]
    pub files: Vec<FileConfig>,
}

/// `model` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// OpenAI-compatible API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            temperature: default_temperature(),
            top_p: None,
            max_output_tokens: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_model() -> String {
    std::env::var(MODEL_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "gpt-4.1-mini".into())
}
fn default_temperature() -> f32 {
    0.1
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

/// `output` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory; relative paths resolve against the config file.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// `pipeline` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How many re-compositions a failed validation may trigger.
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,

    /// Concurrent extraction calls within one document.
    #[serde(default = "default_section_concurrency")]
    pub section_concurrency: usize,

    /// Documents processed at the same time.
    #[serde(default = "default_document_concurrency")]
    pub document_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            section_concurrency: default_section_concurrency(),
            document_concurrency: default_document_concurrency(),
        }
    }
}

fn default_max_revisions() -> u32 {
    2
}
fn default_section_concurrency() -> usize {
    4
}
fn default_document_concurrency() -> usize {
    2
}

/// One `files` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// HTML source path.
    pub input: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Output file name override (`.md` added when missing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl FileConfig {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            title: None,
            context: None,
            output: None,
        }
    }
}

/// An input list entry: either a bare path or a full mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FileEntry {
    Path(PathBuf),
    Full(FileConfig),
}

/// An input list file: a bare sequence or a mapping with `files`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum InputList {
    Entries(Vec<FileEntry>),
    Files { files: Vec<FileEntry> },
}

// ---------------------------------------------------------------------------
// Resolved documents
// ---------------------------------------------------------------------------

/// A document ready for processing, with its artifact targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDocument {
    pub metadata: DocumentMetadata,
    /// Target of the composed Markdown.
    pub output_md: PathBuf,
    /// Target of the knowledge-graph JSON.
    pub output_json: PathBuf,
}

impl RunConfig {
    /// Resolve every `files` entry into metadata and output targets.
    ///
    /// Fails if no documents are configured or two documents would write
    /// the same output file.
    pub fn resolve_documents(&self) -> Result<Vec<ResolvedDocument>> {
        if self.files.is_empty() {
            return Err(Html2DocError::config(
                "`files` must contain at least one entry",
            ));
        }
        ensure_unique_output_paths(&self.files, &self.output.dir)?;

        Ok(self
            .files
            .iter()
            .map(|file| {
                let output_md = output_target(file, &self.output.dir);
                let output_json = graph_target(&output_md);
                let mut metadata = DocumentMetadata::new(&file.input);
                metadata.title = file.title.clone();
                metadata.context = file.context.clone();
                ResolvedDocument {
                    metadata,
                    output_md,
                    output_json,
                }
            })
            .collect())
    }
}

/// Markdown target for `file` under `output_dir`.
pub fn output_target(file: &FileConfig, output_dir: &Path) -> PathBuf {
    match file.output.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
        Some(name) => {
            let mut path = PathBuf::from(name);
            if path.extension().is_none() {
                path.set_extension("md");
            }
            if path.is_absolute() {
                path
            } else {
                output_dir.join(path)
            }
        }
        None => {
            let stem = file
                .input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".into());
            output_dir.join(format!("{stem}.md"))
        }
    }
}

/// Knowledge-graph target next to a Markdown target.
pub fn graph_target(markdown: &Path) -> PathBuf {
    markdown.with_extension("json")
}

/// Reject configurations where two documents share an output file, either
/// the Markdown or the knowledge graph.
pub fn ensure_unique_output_paths(files: &[FileConfig], output_dir: &Path) -> Result<()> {
    let mut seen: HashMap<PathBuf, &Path> = HashMap::new();
    for file in files {
        let markdown = output_target(file, output_dir);
        let graph = graph_target(&markdown);
        for target in [markdown, graph] {
            if let Some(previous) = seen.get(&target) {
                return Err(Html2DocError::config(format!(
                    "{} and {} would both write {}; set a distinct `output` for one of them",
                    previous.display(),
                    file.input.display(),
                    target.display()
                )));
            }
            seen.insert(target, &file.input);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load a run config from `path`, resolving relative paths against its directory.
pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| Html2DocError::io(path, e))?;
    let mut config: RunConfig = parse_by_extension(path, &content)?;

    let base_dir = base_dir_of(path);
    config.output.dir = resolve_path(&config.output.dir, &base_dir);
    for file in &mut config.files {
        file.input = resolve_path(&file.input, &base_dir);
    }

    tracing::debug!(
        path = %path.display(),
        files = config.files.len(),
        model = %config.model.name,
        "loaded run config"
    );
    Ok(config)
}

/// Load an input list file (bare paths or `files` mappings).
pub fn load_input_list(path: &Path) -> Result<Vec<FileConfig>> {
    let content = std::fs::read_to_string(path).map_err(|e| Html2DocError::io(path, e))?;
    let list: InputList = parse_by_extension(path, &content)?;
    let entries = match list {
        InputList::Entries(entries) | InputList::Files { files: entries } => entries,
    };

    if entries.is_empty() {
        return Err(Html2DocError::config(format!(
            "{} lists no input files",
            path.display()
        )));
    }

    let base_dir = base_dir_of(path);
    Ok(entries
        .into_iter()
        .map(|entry| {
            let mut file = match entry {
                FileEntry::Path(p) => FileConfig::new(p),
                FileEntry::Full(f) => f,
            };
            file.input = resolve_path(&file.input, &base_dir);
            file
        })
        .collect())
}

/// Check that the API key env var named by the model config is set and non-empty.
pub fn validate_api_key(model: &ModelConfig) -> Result<()> {
    let var_name = &model.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(()),
        _ => Err(Html2DocError::config(format!(
            "API key not found. Set the {var_name} environment variable \
             (or point `model.api_key_env` at another variable)."
        ))),
    }
}

fn parse_by_extension<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "toml" => toml::from_str(content).map_err(|e| {
            Html2DocError::config(format!("failed to parse {}: {e}", path.display()))
        }),
        "yaml" | "yml" | "" => serde_yaml::from_str(content).map_err(|e| {
            Html2DocError::config(format!("failed to parse {}: {e}", path.display()))
        }),
        other => Err(Html2DocError::config(format!(
            "unsupported config format `.{other}` for {} (expected .yaml, .yml, or .toml)",
            path.display()
        ))),
    }
}

fn base_dir_of(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_bounds() {
        let config = RunConfig::default();
        assert_eq!(config.pipeline.max_revisions, 2);
        assert_eq!(config.pipeline.section_concurrency, 4);
        assert_eq!(config.model.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.output.dir, PathBuf::from("output"));
    }

    #[test]
    fn yaml_config_resolves_relative_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("html2doc.yaml");
        std::fs::write(
            &path,
            r#"
model:
  name: test-model
  temperature: 0.3
output:
  dir: out
pipeline:
  max_revisions: 1
files:
  - input: manuals/reset.html
    title: Password Reset
  - input: /abs/billing.html
"#,
        )
        .expect("write config");

        let config = load_run_config(&path).expect("load");
        assert_eq!(config.model.name, "test-model");
        assert_eq!(config.pipeline.max_revisions, 1);
        assert_eq!(config.pipeline.document_concurrency, 2);
        assert_eq!(config.output.dir, dir.path().join("out"));
        assert_eq!(config.files[0].input, dir.path().join("manuals/reset.html"));
        assert_eq!(config.files[0].title.as_deref(), Some("Password Reset"));
        assert_eq!(config.files[1].input, PathBuf::from("/abs/billing.html"));
    }

    #[test]
    fn toml_config_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("html2doc.toml");
        std::fs::write(
            &path,
            r#"
[model]
name = "toml-model"

[[files]]
input = "a.html"
output = "alpha"
"#,
        )
        .expect("write config");

        let config = load_run_config(&path).expect("load");
        assert_eq!(config.model.name, "toml-model");
        let docs = config.resolve_documents().expect("resolve");
        assert_eq!(docs[0].output_md, dir.path().join("output/alpha.md"));
        assert_eq!(docs[0].output_json, dir.path().join("output/alpha.json"));
        assert_eq!(docs[0].metadata.stem, "a");
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "x=1").expect("write");
        let err = load_run_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn input_list_accepts_strings_and_mappings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inputs.yaml");
        std::fs::write(
            &path,
            "- first.html\n- input: second.html\n  title: Second\n",
        )
        .expect("write");

        let files = load_input_list(&path).expect("load list");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].input, dir.path().join("first.html"));
        assert_eq!(files[1].title.as_deref(), Some("Second"));
    }

    #[test]
    fn input_list_accepts_files_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inputs.yml");
        std::fs::write(&path, "files:\n  - a.html\n").expect("write");
        let files = load_input_list(&path).expect("load list");
        assert_eq!(files[0].input, dir.path().join("a.html"));
    }

    #[test]
    fn empty_input_list_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inputs.yaml");
        std::fs::write(&path, "[]\n").expect("write");
        assert!(load_input_list(&path).is_err());
    }

    #[test]
    fn allows_unique_targets() {
        let files = vec![
            FileConfig::new("/alpha/first.html"),
            FileConfig::new("/beta/second.html"),
        ];
        assert!(ensure_unique_output_paths(&files, Path::new("/out")).is_ok());
    }

    #[test]
    fn detects_duplicate_stems() {
        let files = vec![
            FileConfig::new("/x/manual.html"),
            FileConfig::new("/y/manual.html"),
        ];
        let err = ensure_unique_output_paths(&files, Path::new("/out")).unwrap_err();
        assert!(err.to_string().contains("manual"));
    }

    #[test]
    fn explicit_outputs_disambiguate_stems() {
        let mut a = FileConfig::new("/x/manual.html");
        a.output = Some("alpha.md".into());
        let mut b = FileConfig::new("/y/manual.html");
        b.output = Some("beta".into());
        assert!(ensure_unique_output_paths(&[a, b], Path::new("/out")).is_ok());
    }

    #[test]
    fn explicit_outputs_can_still_collide() {
        let mut a = FileConfig::new("/x/one.html");
        a.output = Some("duplicate.md".into());
        let mut b = FileConfig::new("/y/two.html");
        b.output = Some("duplicate".into());
        assert!(ensure_unique_output_paths(&[a, b], Path::new("/out")).is_err());
    }

    #[test]
    fn graph_targets_collide_across_extensions() {
        let mut a = FileConfig::new("/x/one.html");
        a.output = Some("guide".into());
        let mut b = FileConfig::new("/y/two.html");
        b.output = Some("guide.txt".into());
        let err = ensure_unique_output_paths(&[a, b], Path::new("/out")).unwrap_err();
        assert!(err.to_string().contains("guide.json"));
    }

    #[test]
    fn resolve_requires_files() {
        let err = RunConfig::default().resolve_documents().unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn api_key_validation() {
        let model = ModelConfig {
            // Unique name so other tests cannot set it.
            api_key_env: "HTML2DOC_TEST_NONEXISTENT_KEY_4711".into(),
            ..Default::default()
        };
        let result = validate_api_key(&model);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
