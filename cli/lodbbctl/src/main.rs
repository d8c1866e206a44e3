//! lodbb - drive `#LOD` burst buffer lifecycles from the command line.
//!
//! Validates batch script directives and runs a single job through setup,
//! stage-in, stage-out and teardown, either against the real `lod` tool or
//! a mock runner.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.init_tracing();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
