//! Stage-out worker, chaining into teardown.

use tracing::{error, info};

use crate::request::Phase;
use crate::state::BbState;

use super::teardown::run_teardown;
use super::{PhaseOutcome, WorkerContext, WorkerTarget};

/// Drive a record from `PostRun` through stage-out, then tear it down in
/// the same task when required.
pub(crate) async fn stage_out(ctx: WorkerContext, target: WorkerTarget) {
    let job_id = target.job_id;
    if !ctx.advance(target, BbState::PostRun, BbState::StagingOut) {
        return;
    }

    let outcome = ctx.run_phase(target, Phase::StageOut, BbState::StagingOut).await;

    if ctx.scheduler.find_job(job_id).is_none() {
        error!(
            job_id = %job_id,
            outcome = ?outcome,
            "job gone after burst buffer stage-out, dropping result"
        );
        return;
    }

    match outcome {
        PhaseOutcome::Succeeded => {}
        PhaseOutcome::Failed(description) => {
            ctx.fail(target, BbState::StagingOut, description);
            ctx.scheduler.set_stage_out(job_id, false);
            return;
        }
        PhaseOutcome::Abandoned => return,
    }

    if !ctx.advance(target, BbState::StagingOut, BbState::StagedOut) {
        return;
    }
    info!(job_id = %job_id, "burst buffer stage-out complete");

    let teardown_required = ctx
        .with_current(target, BbState::StagedOut, |record| record.request.teardown_required())
        .unwrap_or(false);

    if teardown_required {
        if ctx.advance(target, BbState::StagedOut, BbState::Teardown) {
            run_teardown(&ctx, target).await;
        }
    } else if ctx.advance(target, BbState::StagedOut, BbState::Complete) {
        ctx.scheduler.set_description(job_id, None);
        ctx.scheduler.set_stage_out(job_id, false);
        ctx.store.lock().touch();
    }
}
