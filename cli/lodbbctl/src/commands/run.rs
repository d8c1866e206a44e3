//! `lodbb run`: drive one job's burst buffer through its lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use lodbb_controller::{
    BbState, CommandRunner, InMemoryScheduler, JobId, JobInfo, JobState, LifecycleController,
    MockResponse, MockRunner, Phase, ProcessRunner, RecordSummary, StageStatus,
};
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use crate::error::CliError;
use crate::output::{display_option, print_info, print_output, print_success};

use super::{read_script, CommandContext};

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Batch script carrying #LOD directives.
    script: PathBuf,

    /// Job id to use.
    #[arg(long, default_value = "1")]
    job_id: u32,

    /// Node list used when the directives do not name one.
    #[arg(long)]
    nodes: Option<String>,

    /// Use a mock runner instead of executing the lod tool.
    #[arg(long)]
    dry_run: bool,

    /// With --dry-run, make this phase fail.
    #[arg(long, value_enum, requires = "dry_run")]
    fail: Option<PhaseArg>,

    /// Cancel the job once stage-in completes instead of running it.
    #[arg(long)]
    cancel: bool,

    /// Milliseconds between progress polls.
    #[arg(long, default_value = "200")]
    poll_ms: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    Setup,
    StageIn,
    StageOut,
    Teardown,
}

impl From<PhaseArg> for Phase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Setup => Phase::Setup,
            PhaseArg::StageIn => Phase::StageIn,
            PhaseArg::StageOut => Phase::StageOut,
            PhaseArg::Teardown => Phase::Teardown,
        }
    }
}

/// Record summary row.
#[derive(Debug, Serialize, Tabled)]
struct RecordRow {
    #[tabled(rename = "Job")]
    job_id: u32,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Phases")]
    phases: String,

    #[tabled(rename = "Started")]
    started: bool,

    #[tabled(rename = "Description", display = "display_option")]
    description: Option<String>,

    #[tabled(rename = "Updated")]
    updated_at: DateTime<Utc>,
}

impl RecordRow {
    fn new(summary: &RecordSummary, job: Option<&JobInfo>) -> Self {
        Self {
            job_id: summary.job_id.0,
            state: summary.state.to_string(),
            phases: summary.phases.to_string(),
            started: summary.started,
            description: job.and_then(|job| job.state_desc.clone()),
            updated_at: summary.updated_at,
        }
    }
}

impl RunCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let script = read_script(&self.script)?;

        let runner: Arc<dyn CommandRunner> = if self.dry_run {
            let mock = MockRunner::new();
            if let Some(phase) = self.fail {
                let phase = Phase::from(phase);
                mock.push(phase.label(), MockResponse::fail(1, "injected failure"));
            }
            Arc::new(mock)
        } else {
            Arc::new(ProcessRunner::new())
        };

        let scheduler = Arc::new(InMemoryScheduler::new());
        let controller = LifecycleController::new(ctx.config.clone(), runner, scheduler.clone());
        let spec = controller
            .validate(&script)?
            .ok_or_else(|| CliError::NoDirectives(self.script.display().to_string()))?;

        let mut job = JobInfo::new(self.job_id)
            .with_burst_buffer(spec)
            .with_start_time(Utc::now());
        if let Some(nodes) = &self.nodes {
            job = job.with_requested_nodes(nodes.clone());
        }
        scheduler.insert(job.clone());

        let result = tokio::select! {
            result = self.drive(&controller, &scheduler, &job) => result,
            _ = tokio::signal::ctrl_c() => {
                print_info("interrupted, cancelling burst buffer");
                controller.cancel(&job)?;
                Err(CliError::Interrupted.into())
            }
        };

        let rows: Vec<RecordRow> = controller
            .state_pack()
            .iter()
            .map(|summary| RecordRow::new(summary, scheduler.job(summary.job_id).as_ref()))
            .collect();
        print_output(&rows, ctx.format);

        controller.shutdown().await;
        result
    }

    async fn drive(
        &self,
        controller: &LifecycleController,
        scheduler: &InMemoryScheduler,
        job: &JobInfo,
    ) -> Result<()> {
        let poll = Duration::from_millis(self.poll_ms);
        let job_id = job.job_id;

        controller.validate2(job)?;
        controller.try_stage_in(std::slice::from_ref(job));
        let stage_in = wait_for(poll, || controller.test_stage_in(job, true)).await;
        info!(job_id = %job_id, status = %stage_in, "stage-in finished");
        if stage_in == StageStatus::Error {
            return Err(failure(controller, scheduler, job_id));
        }

        if self.cancel {
            controller.cancel(job)?;
        } else {
            controller.begin(job)?;
            scheduler.update(job_id, |job| {
                job.state = JobState::Running;
                job.allocated_nodes = self.nodes.clone();
            });
            print_info(&format!("{job_id} running"));
            controller.start_stage_out(job)?;
            let stage_out = wait_for(poll, || controller.test_stage_out(job)).await;
            info!(job_id = %job_id, status = %stage_out, "stage-out finished");
        }

        let state = loop {
            match controller.record_state(job_id) {
                Some(state) if state.is_terminal() => break state,
                None => break BbState::Complete,
                Some(_) => tokio::time::sleep(poll).await,
            }
        };

        if state == BbState::TeardownFail {
            return Err(failure(controller, scheduler, job_id));
        }
        print_success(&format!("{job_id} burst buffer lifecycle complete"));
        Ok(())
    }
}

async fn wait_for(poll: Duration, mut status: impl FnMut() -> StageStatus) -> StageStatus {
    loop {
        match status() {
            StageStatus::Underway => tokio::time::sleep(poll).await,
            done => return done,
        }
    }
}

fn failure(
    controller: &LifecycleController,
    scheduler: &InMemoryScheduler,
    job_id: JobId,
) -> anyhow::Error {
    let state = controller
        .record_state(job_id)
        .map(|state| state.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let description = scheduler
        .job(job_id)
        .and_then(|job| job.state_desc)
        .unwrap_or_else(|| "no description".to_string());
    CliError::Failed {
        job_id: job_id.0,
        state,
        description,
    }
    .into()
}
