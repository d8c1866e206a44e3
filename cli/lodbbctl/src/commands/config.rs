//! `lodbb config`: show the effective configuration.

use anyhow::Result;
use clap::Args;
use lodbb_controller::Phase;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, print_single, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ConfigCommand {}

#[derive(Debug, Serialize, Tabled)]
struct SettingRow {
    #[tabled(rename = "Setting")]
    name: &'static str,

    #[tabled(rename = "Value")]
    value: String,
}

impl ConfigCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        if ctx.format == OutputFormat::Json {
            print_single(&ctx.config);
            return Ok(());
        }

        let config = &ctx.config;
        let mut rows = vec![
            SettingRow {
                name: "lod_path",
                value: config.lod_path.display().to_string(),
            },
            SettingRow {
                name: "lod_conf_path",
                value: config.lod_conf_path.display().to_string(),
            },
        ];
        for phase in [Phase::Setup, Phase::StageIn, Phase::StageOut, Phase::Teardown] {
            rows.push(SettingRow {
                name: match phase {
                    Phase::Setup => "setup_timeout",
                    Phase::StageIn => "stage_in_timeout",
                    Phase::StageOut => "stage_out_timeout",
                    Phase::Teardown => "teardown_timeout",
                },
                value: format!("{}s", config.timeout_for(phase).as_secs()),
            });
        }
        rows.push(SettingRow {
            name: "drain_timeout",
            value: format!("{}s", config.drain_timeout_secs),
        });
        rows.push(SettingRow {
            name: "debug",
            value: config.debug.to_string(),
        });

        print_output(&rows, ctx.format);
        Ok(())
    }
}
