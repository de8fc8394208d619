//! html2doc CLI: turn HTML operator manuals into validated Markdown and a
//! knowledge graph, with a language model doing the reading.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    // Variables already set in the environment win over `.env`.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    let code = commands::run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
