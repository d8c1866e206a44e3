//! Interface to the batch scheduler.
//!
//! The controller reports back through [`JobScheduler`] and never holds on
//! to job data: every worker re-resolves its job by id before touching it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::job::{JobId, JobInfo, StateReason};

/// Operations the controller needs from the scheduler.
///
/// Implementations must be cheap and must not call back into the controller.
pub trait JobScheduler: Send + Sync {
    /// Fresh copy of a job, or `None` if the scheduler no longer knows it.
    fn find_job(&self, job_id: JobId) -> Option<JobInfo>;

    /// Mark a job as failed by a burst buffer operation.
    fn set_failure(&self, job_id: JobId, reason: StateReason, description: String);

    /// Replace (or clear) the job's human-readable description.
    fn set_description(&self, job_id: JobId, description: Option<String>);

    /// Flag whether stage-out is in progress for the job.
    fn set_stage_out(&self, job_id: JobId, in_progress: bool);

    /// Ask for a scheduling pass soon.
    fn queue_job_scheduler(&self);
}

/// Scheduler kept entirely in memory.
///
/// Used by the command-line driver and by tests.
#[derive(Default)]
pub struct InMemoryScheduler {
    jobs: Mutex<HashMap<JobId, JobInfo>>,
    schedule_requests: AtomicUsize,
    wake: Notify,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: JobInfo) {
        self.jobs().insert(job.job_id, job);
    }

    pub fn remove(&self, job_id: JobId) -> Option<JobInfo> {
        self.jobs().remove(&job_id)
    }

    /// Apply `f` to a job, returning `None` if it is unknown.
    pub fn update<R>(&self, job_id: JobId, f: impl FnOnce(&mut JobInfo) -> R) -> Option<R> {
        self.jobs().get_mut(&job_id).map(f)
    }

    pub fn job(&self, job_id: JobId) -> Option<JobInfo> {
        self.find_job(job_id)
    }

    /// Pending jobs, ordered by id.
    pub fn pending_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs()
            .values()
            .filter(|job| job.state.is_pending())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.job_id);
        jobs
    }

    /// Number of scheduling passes requested so far.
    pub fn schedule_requests(&self) -> usize {
        self.schedule_requests.load(Ordering::SeqCst)
    }

    /// Wait for the next scheduling request.
    pub async fn wait_for_schedule(&self) {
        self.wake.notified().await;
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobInfo>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobScheduler for InMemoryScheduler {
    fn find_job(&self, job_id: JobId) -> Option<JobInfo> {
        self.jobs().get(&job_id).cloned()
    }

    fn set_failure(&self, job_id: JobId, reason: StateReason, description: String) {
        self.update(job_id, |job| {
            job.state_reason = Some(reason);
            job.state_desc = Some(description);
        });
    }

    fn set_description(&self, job_id: JobId, description: Option<String>) {
        self.update(job_id, |job| job.state_desc = description);
    }

    fn set_stage_out(&self, job_id: JobId, in_progress: bool) {
        self.update(job_id, |job| job.stage_out = in_progress);
    }

    fn queue_job_scheduler(&self) {
        let count = self.schedule_requests.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, "scheduling pass requested");
        self.wake.notify_one();
    }
}
