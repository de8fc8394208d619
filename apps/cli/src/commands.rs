//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use html2doc_core::{
    DocumentResult, FsPersister, ProgressReporter, RunSummary, run_batch,
};
use html2doc_llm::OpenAiClient;
use html2doc_markdown::parse_sections;
use html2doc_shared::{
    DocumentMetadata, RunConfig, load_input_list, load_run_config, validate_api_key,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// html2doc: convert HTML manuals into validated Markdown and a knowledge graph.
#[derive(Parser)]
#[command(
    name = "html2doc",
    version,
    about = "Convert HTML manuals into validated Markdown and a knowledge graph.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process every document listed in a run config.
    Run {
        /// Run config file (.yaml, .yml, or .toml).
        #[arg(short, long)]
        config: PathBuf,

        /// Override `output.dir`.
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Extra input list file whose entries are appended to `files`.
        #[arg(long)]
        inputs: Option<PathBuf>,

        /// Override `pipeline.max_revisions`.
        #[arg(long)]
        max_revisions: Option<u32>,
    },

    /// Parse one HTML file and print its sections and assets as JSON.
    Sections {
        /// HTML file to parse.
        file: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. `RUST_LOG` takes precedence.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "html2doc=info",
        1 => "html2doc=debug",
        _ => "html2doc=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command and return the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            config,
            output_dir,
            inputs,
            max_revisions,
        } => cmd_run(&config, output_dir, inputs.as_deref(), max_revisions).await,
        Command::Sections { file } => cmd_sections(&file).await,
    }
}

async fn cmd_run(
    config_path: &Path,
    output_dir: Option<PathBuf>,
    inputs: Option<&Path>,
    max_revisions: Option<u32>,
) -> Result<i32> {
    let config = prepare_config(config_path, output_dir, inputs, max_revisions)?;
    let documents = config.resolve_documents()?;
    validate_api_key(&config.model)?;

    let client = OpenAiClient::from_config(&config.model)?;
    info!(
        documents = documents.len(),
        model = %config.model.name,
        output_dir = %config.output.dir.display(),
        max_revisions = config.pipeline.max_revisions,
        "starting run"
    );

    let reporter = CliProgress::new();
    let summary = run_batch(
        documents,
        Arc::new(client),
        Arc::new(FsPersister),
        &config.pipeline,
        &reporter,
    )
    .await;

    print_summary(&summary);
    Ok(if summary.has_failures() { 1 } else { 0 })
}

/// Load the run config and apply command-line overrides.
fn prepare_config(
    config_path: &Path,
    output_dir: Option<PathBuf>,
    inputs: Option<&Path>,
    max_revisions: Option<u32>,
) -> Result<RunConfig> {
    let mut config = load_run_config(config_path)
        .wrap_err_with(|| format!("cannot load {}", config_path.display()))?;

    if let Some(list) = inputs {
        config.files.extend(load_input_list(list)?);
    }
    if let Some(dir) = output_dir {
        config.output.dir = dir;
    }
    if let Some(max) = max_revisions {
        config.pipeline.max_revisions = max;
    }
    Ok(config)
}

async fn cmd_sections(file: &Path) -> Result<i32> {
    let html = tokio::fs::read_to_string(file)
        .await
        .wrap_err_with(|| format!("cannot read {}", file.display()))?;
    let metadata = DocumentMetadata::new(file);
    let (sections, assets) = parse_sections(&html, &metadata)?;

    let json = serde_json::json!({
        "stem": metadata.stem,
        "sections": sections,
        "assets": assets,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(0)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_summary(summary: &RunSummary) {
    println!();
    for result in &summary.results {
        println!("{}", format_result(result));
    }
    println!();
    println!("succeeded {} / failed {}", summary.succeeded, summary.failed);
    println!(
        "tokens: {} in / {} out",
        summary.usage.input_tokens, summary.usage.output_tokens
    );
}

/// One summary line per document.
fn format_result(result: &DocumentResult) -> String {
    let input = result.input_path.display();
    if result.is_success() {
        let md = result
            .output_md_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let json = result
            .output_json_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!("[OK] {input} -> {md} (graph: {json})")
    } else {
        let error = result.error_message.as_deref().unwrap_or("unknown error");
        match &result.output_md_path {
            Some(md) => format!("[NG] {input}: {error} (last output: {})", md.display()),
            None => format!("[NG] {input}: {error}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn batch_started(&self, total: usize) {
        self.spinner
            .set_message(format!("Processing {total} document(s)"));
    }

    fn document_finished(&self, result: &DocumentResult, finished: usize, total: usize) {
        self.spinner.set_message(format!(
            "[{finished}/{total}] {} {}",
            result.stem, result.status
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
