//! feedingest CLI: runs per-site fetch/parse/normalize stages.
//!
//! Discovers site runners, drives them through the stage pipeline against a
//! local or remote output root, and publishes normalized records.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    let code = commands::run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
