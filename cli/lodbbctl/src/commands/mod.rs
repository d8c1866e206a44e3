//! CLI commands.

mod config;
mod run;
mod validate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lodbb_controller::ControllerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::output::OutputFormat;

/// lodbb - Lustre-on-demand burst buffer tooling.
#[derive(Debug, Parser)]
#[command(name = "lodbb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Controller configuration file (TOML). Defaults to LODBB_* variables.
    #[arg(long, global = true, env = "LODBB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check the #LOD directives of a batch script.
    Validate(validate::ValidateCommand),

    /// Drive one job's burst buffer through its whole lifecycle.
    Run(run::RunCommand),

    /// Show the effective controller configuration.
    Config(config::ConfigCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Install the tracing subscriber. Logs go to stderr.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.as_str()));
        let json = self.log_json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        });
        let text = (!self.log_json).then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
        });
        tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(text)
            .init();
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::from_env().context("loading configuration from environment")?,
        };

        let ctx = CommandContext { config, format };

        match self.command {
            Commands::Validate(cmd) => cmd.run(ctx).await,
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::Config(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("lodbb {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: ControllerConfig,
    pub format: OutputFormat,
}

/// Read a batch script from disk.
fn read_script(path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
