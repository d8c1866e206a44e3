//! `lodbb validate`: check a batch script's directives.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use lodbb_controller::{Phase, Provisioning, RequestSpec};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_output, print_single, print_success, OutputFormat};

use super::{read_script, CommandContext};

#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Batch script to check.
    script: PathBuf,
}

/// One phase of the parsed request.
#[derive(Debug, Serialize, Tabled)]
struct PhaseRow {
    #[tabled(rename = "Phase")]
    phase: String,

    #[tabled(rename = "Requested")]
    requested: bool,

    #[tabled(rename = "Command")]
    command: String,
}

impl ValidateCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let script = read_script(&self.script)?;
        let spec = RequestSpec::from_script(&script, &ctx.config.lod_conf_path)?
            .ok_or_else(|| CliError::NoDirectives(self.script.display().to_string()))?;

        match ctx.format {
            OutputFormat::Json => print_single(&spec),
            OutputFormat::Table => {
                print_output(&phase_rows(&spec, &ctx), ctx.format);
                print_success(&format!("{} is valid", self.script.display()));
            }
        }
        Ok(())
    }
}

fn phase_rows(spec: &RequestSpec, ctx: &CommandContext) -> Vec<PhaseRow> {
    let phases = spec.phases();
    [
        (Phase::Setup, phases.setup),
        (Phase::StageIn, phases.stage_in),
        (Phase::StageOut, phases.stage_out),
        (Phase::Teardown, phases.teardown),
    ]
    .into_iter()
    .map(|(phase, requested)| PhaseRow {
        phase: phase.label().to_string(),
        requested,
        command: if requested {
            let mut argv = vec![ctx.config.lod_path.display().to_string()];
            argv.extend(spec.command_args(phase, None));
            argv.join(" ")
        } else {
            "-".to_string()
        },
    })
    .collect()
}
