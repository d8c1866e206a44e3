//! Controller errors.
//!
//! Only call-time misuse surfaces here. Failures discovered by workers are
//! recorded in the job record and the job's description instead.

use lodbb_directives::DirectiveError;
use thiserror::Error;

use crate::job::JobId;
use crate::state::BbState;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// A job with burst buffer directives has no record.
    #[error("{0}: could not find burst buffer record")]
    MissingRecord(JobId),

    /// `begin` was called before stage-in finished.
    #[error("{job_id}: stage-in not complete (state {state})")]
    StageInIncomplete { job_id: JobId, state: BbState },

    /// A state change not allowed by the lifecycle.
    #[error("{job_id}: invalid burst buffer transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: BbState,
        to: BbState,
    },

    #[error("invalid burst buffer request: {0}")]
    Directive(#[from] DirectiveError),
}
