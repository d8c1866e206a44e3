//! Burst buffer lifecycle controller for the `burst_buffer/lod` plugin.
//!
//! The controller provisions a Lustre-on-demand file system around a batch
//! job: setup and stage-in before the job starts, stage-out and teardown
//! after it ends. Every step shells out to the `lod` tool.
//!
//! ## Architecture
//!
//! - [`LifecycleController`] is called by the scheduler. It owns the
//!   [`JobStateStore`] and spawns one worker task per job and phase.
//! - Workers run commands through a [`CommandRunner`] and report back
//!   through the [`JobScheduler`] trait.
//! - Each job's progress is a [`BbState`] that only moves along the edges
//!   allowed by [`BbState::can_transition_to`].

pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod request;
pub mod runner;
pub mod scheduler;
pub mod state;
mod workers;

pub use config::{ConfigError, ControllerConfig};
pub use controller::{LifecycleController, StageStatus};
pub use error::ControllerError;
pub use job::{ArrayMembership, JobId, JobInfo, JobOwner, JobState, StateReason};
pub use request::{Phase, PhaseFlags, Provisioning, ProvisioningRequest, RequestSpec, PLUGIN_TYPE};
pub use runner::{
    CancelRegistry, CommandOutput, CommandRunner, ExitStatus, Invocation, MockResponse, MockRunner,
    ProcessRunner,
};
pub use scheduler::{InMemoryScheduler, JobScheduler};
pub use state::{BbState, JobRecord, JobStateStore, RecordSummary};
pub use workers::WorkerKind;
