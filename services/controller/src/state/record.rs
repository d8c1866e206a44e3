//! Lifecycle states and job records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;
use crate::job::JobId;
use crate::request::{PhaseFlags, ProvisioningRequest};

/// Maximum number of states remembered per record.
const HISTORY_LIMIT: usize = 64;

/// Burst buffer lifecycle state of one job.
///
/// Variants are declared in progression order, so `<`/`>=` comparisons follow
/// the lifecycle. `TeardownFail` sorts between `Teardown` and `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BbState {
    Pending,
    StagingIn,
    StagedIn,
    Running,
    PostRun,
    StagingOut,
    StagedOut,
    Teardown,
    TeardownFail,
    Complete,
}

impl BbState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::StagingIn => "staging-in",
            Self::StagedIn => "staged-in",
            Self::Running => "running",
            Self::PostRun => "post-run",
            Self::StagingOut => "staging-out",
            Self::StagedOut => "staged-out",
            Self::Teardown => "teardown",
            Self::TeardownFail => "teardown-fail",
            Self::Complete => "complete",
        }
    }

    /// No further transition will happen without a requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::TeardownFail)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: BbState) -> bool {
        use BbState::*;

        matches!(
            (*self, next),
            (Pending, StagingIn)
                | (Pending, Complete)
                | (StagingIn, StagedIn)
                | (StagingIn, Teardown)
                | (StagingIn, TeardownFail)
                | (StagedIn, Running)
                | (StagedIn, Teardown)
                | (Running, PostRun)
                | (Running, Teardown)
                | (PostRun, StagingOut)
                | (PostRun, TeardownFail)
                | (StagingOut, StagedOut)
                | (StagingOut, TeardownFail)
                | (StagedOut, Teardown)
                | (StagedOut, Complete)
                | (Teardown, Complete)
                | (Teardown, TeardownFail)
                | (Complete, Pending)
        )
    }
}

impl fmt::Display for BbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Burst buffer record for one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub(crate) state: BbState,
    pub(crate) request: ProvisioningRequest,

    /// Distinguishes record instances created for the same job id.
    pub generation: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    history: Vec<BbState>,
}

impl JobRecord {
    pub(crate) fn new(request: ProvisioningRequest, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            job_id: request.job_id,
            state: BbState::Pending,
            request,
            generation,
            created_at: now,
            updated_at: now,
            history: vec![BbState::Pending],
        }
    }

    /// Move to `next`, rejecting edges the lifecycle does not have.
    pub fn transition(&mut self, next: BbState) -> Result<(), ControllerError> {
        if !self.state.can_transition_to(next) {
            return Err(ControllerError::InvalidTransition {
                job_id: self.job_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(next);
        Ok(())
    }

    /// Reuse a completed record for a requeued job under a new generation.
    pub(crate) fn requeue(
        &mut self,
        request: ProvisioningRequest,
        generation: u64,
    ) -> Result<(), ControllerError> {
        self.transition(BbState::Pending)?;
        self.request = request;
        self.generation = generation;
        Ok(())
    }

    pub fn state(&self) -> BbState {
        self.state
    }

    pub fn request(&self) -> &ProvisioningRequest {
        &self.request
    }

    /// States this record has been in, oldest first.
    pub fn history(&self) -> &[BbState] {
        &self.history
    }

    pub fn phases(&self) -> PhaseFlags {
        self.request.phases()
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            job_id: self.job_id,
            state: self.state,
            phases: self.phases(),
            started: self.request.started,
            user_id: self.request.owner.user_id,
            account: self.request.owner.account.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Serializable view of a record for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub job_id: JobId,
    pub state: BbState,
    pub phases: PhaseFlags,
    pub started: bool,
    pub user_id: u32,
    pub account: Option<String>,
    pub updated_at: DateTime<Utc>,
}
