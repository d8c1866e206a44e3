//! Scheduler-side view of a batch job.
//!
//! The controller never owns jobs. It receives [`JobInfo`] snapshots from the
//! scheduler and re-resolves them by [`JobId`] whenever it needs fresh data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{Provisioning, RequestSpec};

/// Scheduler-assigned job identifier, stable for the job's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId={}", self.0)
    }
}

impl From<u32> for JobId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Coarse job state as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Complete,
    Cancelled,
}

impl JobState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

/// Membership of a job in a job array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMembership {
    /// Not part of an array.
    #[default]
    None,
    /// The unresolved array template; tasks have not been split off yet.
    Template,
    /// A concrete array task.
    Task(u32),
}

/// Reason code shown next to a job that cannot proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    /// A burst buffer operation failed.
    FailBurstBufferOp,
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailBurstBufferOp => f.write_str("BurstBufferOperation"),
        }
    }
}

/// Ownership and accounting data copied into a record at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOwner {
    pub user_id: u32,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub qos: Option<String>,
}

/// Snapshot of a job as provided by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub state: JobState,

    /// Projected start time computed by the scheduler's backfill pass.
    pub start_time: Option<DateTime<Utc>>,

    pub submit_time: DateTime<Utc>,

    pub owner: JobOwner,

    /// Node list requested at submission.
    pub requested_nodes: Option<String>,

    /// Node list allocated once the job was scheduled.
    pub allocated_nodes: Option<String>,

    pub array: ArrayMembership,

    /// Parsed burst buffer request, if the job carried directives.
    pub burst_buffer: Option<RequestSpec>,

    pub state_reason: Option<StateReason>,

    /// Free-form, user-visible description of the job's state.
    pub state_desc: Option<String>,

    /// Set while the job's stage-out is in progress.
    pub stage_out: bool,
}

impl JobInfo {
    /// Create a pending job with no burst buffer request.
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Pending,
            start_time: None,
            submit_time: Utc::now(),
            owner: JobOwner::default(),
            requested_nodes: None,
            allocated_nodes: None,
            array: ArrayMembership::None,
            burst_buffer: None,
            state_reason: None,
            state_desc: None,
            stage_out: false,
        }
    }

    pub fn with_burst_buffer(mut self, spec: RequestSpec) -> Self {
        self.burst_buffer = Some(spec);
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_requested_nodes(mut self, nodes: impl Into<String>) -> Self {
        self.requested_nodes = Some(nodes.into());
        self
    }

    /// True when the job carries a non-empty burst buffer request.
    pub fn has_burst_buffer(&self) -> bool {
        self.burst_buffer
            .as_ref()
            .is_some_and(|spec| !spec.is_empty())
    }

    /// True for the array template that still stands for unsplit tasks.
    pub fn is_array_template(&self) -> bool {
        matches!(self.array, ArrayMembership::Template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodbb_directives::LodRequest;

    #[test]
    fn test_job_without_directives_has_no_burst_buffer() {
        let job = JobInfo::new(7);
        assert!(!job.has_burst_buffer());
        assert_eq!(job.job_id.to_string(), "JobId=7");
    }

    #[test]
    fn test_empty_request_is_not_a_burst_buffer() {
        let job = JobInfo::new(7).with_burst_buffer(RequestSpec::Lod(LodRequest::default()));
        assert!(!job.has_burst_buffer());
    }

    #[test]
    fn test_array_template() {
        let mut job = JobInfo::new(7);
        assert!(!job.is_array_template());
        job.array = ArrayMembership::Template;
        assert!(job.is_array_template());
        job.array = ArrayMembership::Task(3);
        assert!(!job.is_array_template());
    }
}
