//! Stage-in worker: setup followed by data stage-in.

use tracing::info;

use crate::request::Phase;
use crate::state::BbState;

use super::{PhaseOutcome, WorkerContext, WorkerTarget};

/// Drive a record from `StagingIn` to `StagedIn`.
///
/// The controller moves the record to `StagingIn` before spawning.
pub(crate) async fn stage_in(ctx: WorkerContext, target: WorkerTarget) {
    let job_id = target.job_id;
    let Some(phases) = ctx.with_current(target, BbState::StagingIn, |record| record.phases()) else {
        return;
    };

    if phases.setup {
        match ctx.run_phase(target, Phase::Setup, BbState::StagingIn).await {
            PhaseOutcome::Succeeded => {
                // Recorded even if a cancel moved the record on, so the
                // teardown that follows knows an allocation exists.
                ctx.store.with_record(job_id, |record| {
                    if record.generation == target.generation {
                        record.request.started = true;
                    }
                });
            }
            PhaseOutcome::Failed(description) => {
                ctx.fail(target, BbState::StagingIn, description);
                return;
            }
            PhaseOutcome::Abandoned => return,
        }
    }

    if phases.stage_in {
        match ctx.run_phase(target, Phase::StageIn, BbState::StagingIn).await {
            PhaseOutcome::Succeeded => {}
            PhaseOutcome::Failed(description) => {
                ctx.fail(target, BbState::StagingIn, description);
                return;
            }
            PhaseOutcome::Abandoned => return,
        }
    }

    if ctx.advance(target, BbState::StagingIn, BbState::StagedIn) {
        info!(job_id = %job_id, "burst buffer stage-in complete");
        ctx.store.lock().touch();
        ctx.scheduler.queue_job_scheduler();
    }
}
