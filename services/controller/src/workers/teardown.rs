//! Teardown worker.

use tracing::info;

use crate::request::Phase;
use crate::state::BbState;

use super::{PhaseOutcome, WorkerContext, WorkerTarget};

pub(crate) async fn teardown(ctx: WorkerContext, target: WorkerTarget) {
    run_teardown(&ctx, target).await;
}

/// Finish a record sitting in `Teardown`.
///
/// The external tool only runs when setup created an allocation and the job
/// asked for it to be stopped; otherwise the record completes directly.
pub(super) async fn run_teardown(ctx: &WorkerContext, target: WorkerTarget) {
    let job_id = target.job_id;
    let Some(required) = ctx.with_current(target, BbState::Teardown, |record| {
        record.request.teardown_required()
    }) else {
        return;
    };

    if required {
        match ctx.run_phase(target, Phase::Teardown, BbState::Teardown).await {
            PhaseOutcome::Succeeded => {}
            PhaseOutcome::Failed(description) => {
                ctx.fail(target, BbState::Teardown, description);
                ctx.scheduler.set_stage_out(job_id, false);
                return;
            }
            PhaseOutcome::Abandoned => return,
        }
    }

    if ctx.advance(target, BbState::Teardown, BbState::Complete) {
        info!(job_id = %job_id, ran_command = required, "burst buffer torn down");
        ctx.scheduler.set_description(job_id, None);
        ctx.scheduler.set_stage_out(job_id, false);
        ctx.store.lock().touch();
    }
}
