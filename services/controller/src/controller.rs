//! Lifecycle controller.
//!
//! [`LifecycleController`] is the entry point the scheduler calls. Entry
//! points only touch records under the store lock and spawn workers; they
//! never wait on the external tool.

use std::fmt::{self, Write as _};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::job::{JobId, JobInfo, StateReason};
use crate::request::{Provisioning, RequestSpec, PLUGIN_TYPE};
use crate::runner::{CancelRegistry, CommandRunner};
use crate::scheduler::JobScheduler;
use crate::state::{BbState, JobRecord, JobStateStore, RecordSummary};
use crate::workers::{self, WorkerContext, WorkerKind, WorkerSet, WorkerTarget};

/// Three-valued answer of the stage-in/stage-out polling predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Underway,
    Complete,
    Error,
}

impl StageStatus {
    /// Numeric form used by the scheduler: 0 underway, 1 complete, -1 error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Underway => 0,
            Self::Complete => 1,
            Self::Error => -1,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Underway => "underway",
            Self::Complete => "complete",
            Self::Error => "error",
        })
    }
}

/// Per-job burst buffer lifecycle controller.
pub struct LifecycleController {
    config: RwLock<Arc<ControllerConfig>>,
    store: Arc<JobStateStore>,
    scheduler: Arc<dyn JobScheduler>,
    runner: Arc<dyn CommandRunner>,
    registry: CancelRegistry,
    workers: WorkerSet,
}

impl LifecycleController {
    pub fn new(
        config: ControllerConfig,
        runner: Arc<dyn CommandRunner>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        info!(
            plugin = PLUGIN_TYPE,
            lod_path = %config.lod_path.display(),
            lod_conf_path = %config.lod_conf_path.display(),
            "initializing burst buffer controller"
        );
        Self {
            config: RwLock::new(Arc::new(config)),
            store: Arc::new(JobStateStore::new()),
            scheduler,
            runner,
            registry: CancelRegistry::new(),
            workers: WorkerSet::new(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<ControllerConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new configuration. Running workers keep the old one.
    pub fn reconfig(&self, config: ControllerConfig) {
        info!(
            lod_path = %config.lod_path.display(),
            debug = config.debug,
            "reloading burst buffer configuration"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            runner: self.runner.clone(),
            registry: self.registry.clone(),
            config: self.config(),
        }
    }

    fn trace_entry(&self, operation: &'static str, job_id: JobId) {
        if self.config().debug {
            info!(plugin = PLUGIN_TYPE, operation, job_id = %job_id, "burst buffer entry point");
        } else {
            debug!(operation, job_id = %job_id, "burst buffer entry point");
        }
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Check a batch script's directives at submission time.
    ///
    /// Returns `None` for a script without directives.
    pub fn validate(&self, script: &str) -> Result<Option<RequestSpec>, ControllerError> {
        let spec = RequestSpec::from_script(script, &self.config().lod_conf_path)?;
        if let Some(spec) = &spec {
            debug!(phases = %spec.phases(), "validated burst buffer directives");
        }
        Ok(spec)
    }

    /// Create the record once the job has an id.
    ///
    /// Records are still created during shutdown; only new stage-in is
    /// refused.
    pub fn validate2(&self, job: &JobInfo) -> Result<(), ControllerError> {
        self.trace_entry("validate2", job.job_id);
        self.store.get_or_create(job);
        Ok(())
    }

    /// Nothing to load: capacity state lives in the external tool.
    pub fn load_state(&self, _init: bool) -> Result<(), ControllerError> {
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Stage-in
    // ---------------------------------------------------------------------

    /// Start stage-in for eligible pending jobs, soonest projected start
    /// first. Returns the jobs a worker was spawned for, in spawn order.
    pub fn try_stage_in(&self, jobs: &[JobInfo]) -> Vec<JobId> {
        if self.store.is_shutting_down() {
            return Vec::new();
        }

        let mut candidates: Vec<&JobInfo> = jobs
            .iter()
            .filter(|job| {
                job.state.is_pending()
                    && job.start_time.is_some()
                    && job.has_burst_buffer()
                    && !job.is_array_template()
            })
            .collect();
        candidates.sort_by_key(|job| (job.start_time, job.submit_time, job.job_id));

        let ctx = self.context();
        let mut spawned = Vec::new();
        for job in candidates {
            let Some(target) = self.claim_for_stage_in(job) else {
                continue;
            };
            if self
                .workers
                .spawn(target, WorkerKind::StageIn, workers::stage_in(ctx.clone(), target))
            {
                info!(job_id = %job.job_id, "burst buffer stage-in started");
                spawned.push(job.job_id);
            }
        }
        spawned
    }

    /// Move a candidate's record to `StagingIn`, resetting a requeued one.
    fn claim_for_stage_in(&self, job: &JobInfo) -> Option<WorkerTarget> {
        let mut guard = self.store.lock();
        guard.get_or_create(job)?;
        if let Err(e) = guard.requeue(job) {
            warn!(job_id = %job.job_id, error = %e, "failed to reset requeued burst buffer record");
            return None;
        }

        let record = guard.get_mut(job.job_id)?;
        if record.state >= BbState::StagingIn {
            return None;
        }
        if self.workers.is_running(job.job_id, WorkerKind::StageIn) {
            return None;
        }
        record.transition(BbState::StagingIn).ok()?;
        Some(WorkerTarget::of(record))
    }

    /// Poll stage-in progress.
    ///
    /// With `test_only` false a missing record is created and reported as
    /// underway.
    pub fn test_stage_in(&self, job: &JobInfo, test_only: bool) -> StageStatus {
        self.trace_entry("test_stage_in", job.job_id);
        if !job.has_burst_buffer() {
            return StageStatus::Complete;
        }

        let state = match self.store.state(job.job_id) {
            Some(state) => state,
            None if test_only => {
                debug!(job_id = %job.job_id, "burst buffer record not found");
                return StageStatus::Error;
            }
            None => match self.store.get_or_create(job) {
                Some(record) => record.state,
                None => return StageStatus::Error,
            },
        };

        match state {
            BbState::Teardown | BbState::TeardownFail => StageStatus::Error,
            state if state <= BbState::StagingIn => StageStatus::Underway,
            _ => StageStatus::Complete,
        }
    }

    /// Claim the staged-in buffer as the job starts.
    pub fn begin(&self, job: &JobInfo) -> Result<(), ControllerError> {
        self.trace_entry("begin", job.job_id);
        if !job.has_burst_buffer() {
            return Ok(());
        }

        let result = self
            .store
            .with_record(job.job_id, |record| {
                let state = record.state;
                if state == BbState::StagedIn {
                    record.transition(BbState::Running)
                } else {
                    Err(ControllerError::StageInIncomplete {
                        job_id: record.job_id,
                        state,
                    })
                }
            });

        match result {
            Some(result) => {
                if result.is_ok() {
                    self.store.lock().touch();
                }
                result
            }
            None => {
                error!(job_id = %job.job_id, "no burst buffer record for job with directives");
                self.scheduler.set_failure(
                    job.job_id,
                    StateReason::FailBurstBufferOp,
                    "Could not find burst buffer record".to_string(),
                );
                Err(ControllerError::MissingRecord(job.job_id))
            }
        }
    }

    /// Nothing to revoke: the buffer stays with the job until teardown.
    pub fn revoke_alloc(&self, job: &JobInfo) -> Result<(), ControllerError> {
        self.trace_entry("revoke_alloc", job.job_id);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Stage-out and teardown
    // ---------------------------------------------------------------------

    /// Start stage-out after the job ran, or go straight to teardown.
    pub fn start_stage_out(&self, job: &JobInfo) -> Result<(), ControllerError> {
        self.trace_entry("start_stage_out", job.job_id);

        let mut guard = self.store.lock();
        let Some(record) = guard.get_mut(job.job_id) else {
            debug!(job_id = %job.job_id, "no burst buffer record, nothing to stage out");
            return Ok(());
        };
        let target = WorkerTarget::of(record);
        let wants_stage_out = record.phases().stage_out;
        let state = record.state;

        match state {
            BbState::Pending => {
                record.transition(BbState::Complete)?;
                guard.touch();
            }
            BbState::Running if wants_stage_out => {
                record.transition(BbState::PostRun)?;
                guard.touch();
                drop(guard);
                self.scheduler.set_stage_out(job.job_id, true);
                self.scheduler.set_description(
                    job.job_id,
                    Some(format!("{PLUGIN_TYPE}: Stage-out in progress")),
                );
                if !self.workers.spawn(
                    target,
                    WorkerKind::StageOut,
                    workers::stage_out(self.context(), target),
                ) {
                    warn!(job_id = %job.job_id, "stage-out worker for this record already running");
                }
            }
            _ if state < BbState::PostRun => {
                record.transition(BbState::Teardown)?;
                guard.touch();
                drop(guard);
                self.registry.cancel_job(job.job_id);
                self.spawn_teardown(target);
            }
            _ => {
                debug!(job_id = %job.job_id, state = %state, "stage-out already handled");
            }
        }
        Ok(())
    }

    /// Poll stage-out progress.
    pub fn test_stage_out(&self, job: &JobInfo) -> StageStatus {
        self.trace_entry("test_stage_out", job.job_id);
        if !job.has_burst_buffer() {
            return StageStatus::Complete;
        }

        match self.store.state(job.job_id) {
            None | Some(BbState::Pending) => StageStatus::Complete,
            Some(BbState::TeardownFail) => StageStatus::Error,
            Some(state) if state < BbState::PostRun => StageStatus::Error,
            Some(state) if state > BbState::StagingOut => StageStatus::Complete,
            Some(_) => StageStatus::Underway,
        }
    }

    /// Post-run work happens inside stage-out.
    pub fn test_post_run(&self, job: &JobInfo) -> StageStatus {
        self.trace_entry("test_post_run", job.job_id);
        StageStatus::Complete
    }

    /// Cancel a job's burst buffer work.
    ///
    /// Unstarted records complete immediately. Records past `Pending` but
    /// before `PostRun` have their commands cancelled and are torn down.
    /// Later states are left alone, so repeated calls are no-ops.
    pub fn cancel(&self, job: &JobInfo) -> Result<(), ControllerError> {
        self.trace_entry("cancel", job.job_id);

        let mut guard = self.store.lock();
        let Some(record) = guard.get_mut(job.job_id) else {
            debug!(job_id = %job.job_id, "no burst buffer record to cancel");
            return Ok(());
        };
        let target = WorkerTarget::of(record);
        let state = record.state;

        match state {
            BbState::Pending => {
                record.transition(BbState::Complete)?;
                guard.touch();
                info!(job_id = %job.job_id, "burst buffer cancelled before any work");
            }
            _ if state < BbState::PostRun => {
                record.transition(BbState::Teardown)?;
                guard.touch();
                drop(guard);
                let cancelled = self.registry.cancel_job(job.job_id);
                info!(job_id = %job.job_id, from = %state, cancelled, "burst buffer cancelled, tearing down");
                self.spawn_teardown(target);
            }
            _ => {
                debug!(job_id = %job.job_id, state = %state, "burst buffer cancel ignored");
            }
        }
        Ok(())
    }

    /// Teardown waits for the job's other workers, so it never reads
    /// `started` before a racing setup has reported back.
    fn spawn_teardown(&self, target: WorkerTarget) {
        if !self.workers.spawn_after_job(
            target,
            WorkerKind::Teardown,
            workers::teardown(self.context(), target),
        ) {
            warn!(job_id = %target.job_id, "teardown worker for this record already running");
        }
    }

    // ---------------------------------------------------------------------
    // Accounting
    // ---------------------------------------------------------------------

    /// Best-effort time at which the job's buffer could be ready.
    pub fn estimated_start(&self, job: &JobInfo) -> DateTime<Utc> {
        self.trace_entry("estimated_start", job.job_id);
        Utc::now()
    }

    /// Total allocated buffer size. Capacity is tracked by the external tool.
    pub fn system_size(&self) -> u64 {
        0
    }

    /// Trackable-resource counts are not reported by this plugin.
    pub fn set_tres_count(&self) -> u64 {
        0
    }

    /// Burst buffer specs are not translated to trackable resources.
    pub fn xlate_to_tres(&self, _burst_buffer: &str) -> Option<String> {
        None
    }

    // ---------------------------------------------------------------------
    // Records
    // ---------------------------------------------------------------------

    pub fn record(&self, job_id: JobId) -> Option<JobRecord> {
        self.store.find(job_id)
    }

    pub fn record_state(&self, job_id: JobId) -> Option<BbState> {
        self.store.state(job_id)
    }

    /// Serializable summaries of every record.
    pub fn state_pack(&self) -> Vec<RecordSummary> {
        self.store
            .snapshot()
            .iter()
            .map(JobRecord::summary)
            .collect()
    }

    /// Human-readable summary of every record.
    pub fn status(&self) -> String {
        let records = self.store.snapshot();
        let now = Utc::now();
        let mut out = format!(
            "{PLUGIN_TYPE}: {} records, {} workers, {} commands running\n",
            records.len(),
            self.workers.running_count(),
            self.runner.active_count(),
        );
        for record in &records {
            let _ = writeln!(
                out,
                "  {} state={} phases={} started={} age={}s",
                record.job_id,
                record.state,
                record.phases(),
                record.request.started,
                (now - record.created_at).num_seconds(),
            );
        }
        out
    }

    /// Time of the last change the scheduler should notice.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.store.last_update()
    }

    /// Number of live worker tasks.
    pub fn active_workers(&self) -> usize {
        self.workers.running_count()
    }

    /// Drop finished records whose jobs are no longer pending.
    pub fn reap(&self) -> usize {
        let removed = self.store.lock().remove_where(|record| {
            record.state.is_terminal()
                && self
                    .scheduler
                    .find_job(record.job_id)
                    .is_none_or(|job| !job.state.is_pending())
        });
        if removed > 0 {
            debug!(removed, "reaped burst buffer records");
        }
        removed
    }

    /// Drop a record unconditionally when the scheduler purges the job.
    pub fn purge(&self, job_id: JobId) -> bool {
        self.trace_entry("purge", job_id);
        self.store.remove(job_id).is_some()
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Stop the controller.
    ///
    /// New stage-in is refused, running commands are terminated, and workers
    /// are given the drain timeout before being aborted.
    pub async fn shutdown(&self) {
        info!("shutting down burst buffer controller");
        self.store.begin_shutdown();
        self.runner.shutdown();

        let aborted = self.workers.drain(self.config().drain_timeout()).await;
        let cleared = self.store.clear();
        info!(aborted, cleared, "burst buffer controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use crate::scheduler::InMemoryScheduler;
    use lodbb_directives::LodRequest;
    use rstest::rstest;

    fn controller() -> (LifecycleController, Arc<InMemoryScheduler>) {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let controller = LifecycleController::new(
            ControllerConfig::default(),
            Arc::new(MockRunner::new()),
            scheduler.clone(),
        );
        (controller, scheduler)
    }

    fn bb_job(id: u32) -> JobInfo {
        let lod = LodRequest {
            setup: true,
            stop: true,
            ..Default::default()
        };
        JobInfo::new(id).with_burst_buffer(RequestSpec::Lod(lod))
    }

    fn force_state(controller: &LifecycleController, job_id: JobId, state: BbState) {
        controller
            .store
            .with_record(job_id, |record| record.state = state)
            .unwrap();
    }

    #[test]
    fn test_stage_status_codes() {
        assert_eq!(StageStatus::Underway.code(), 0);
        assert_eq!(StageStatus::Complete.code(), 1);
        assert_eq!(StageStatus::Error.code(), -1);
    }

    #[test]
    fn test_job_without_buffer_is_always_complete() {
        let (controller, _) = controller();
        let job = JobInfo::new(1);

        assert_eq!(controller.test_stage_in(&job, true), StageStatus::Complete);
        assert_eq!(controller.test_stage_out(&job), StageStatus::Complete);
        assert!(controller.begin(&job).is_ok());
        assert!(controller.record(job.job_id).is_none());
    }

    #[test]
    fn test_stage_in_creates_record_unless_test_only() {
        let (controller, _) = controller();
        let job = bb_job(2);

        assert_eq!(controller.test_stage_in(&job, true), StageStatus::Error);
        assert_eq!(controller.test_stage_in(&job, false), StageStatus::Underway);
        assert_eq!(controller.record_state(job.job_id), Some(BbState::Pending));
    }

    #[rstest]
    #[case(BbState::StagingIn, StageStatus::Underway)]
    #[case(BbState::StagedIn, StageStatus::Complete)]
    #[case(BbState::Running, StageStatus::Complete)]
    #[case(BbState::TeardownFail, StageStatus::Error)]
    #[case(BbState::Teardown, StageStatus::Error)]
    fn test_stage_in_by_state(#[case] state: BbState, #[case] expected: StageStatus) {
        let (controller, _) = controller();
        let job = bb_job(3);
        controller.validate2(&job).unwrap();
        force_state(&controller, job.job_id, state);

        assert_eq!(controller.test_stage_in(&job, true), expected);
    }

    #[rstest]
    #[case(BbState::Pending, StageStatus::Complete)]
    #[case(BbState::Running, StageStatus::Error)]
    #[case(BbState::PostRun, StageStatus::Underway)]
    #[case(BbState::StagingOut, StageStatus::Underway)]
    #[case(BbState::StagedOut, StageStatus::Complete)]
    #[case(BbState::Complete, StageStatus::Complete)]
    #[case(BbState::TeardownFail, StageStatus::Error)]
    fn test_stage_out_by_state(#[case] state: BbState, #[case] expected: StageStatus) {
        let (controller, _) = controller();
        let job = bb_job(4);
        controller.validate2(&job).unwrap();
        force_state(&controller, job.job_id, state);

        assert_eq!(controller.test_stage_out(&job), expected);
    }

    #[test]
    fn test_begin_without_record_fails_job() {
        let (controller, scheduler) = controller();
        let job = bb_job(5);
        scheduler.insert(job.clone());

        let err = controller.begin(&job).unwrap_err();
        assert!(matches!(err, ControllerError::MissingRecord(JobId(5))));

        let job = scheduler.job(JobId(5)).unwrap();
        assert_eq!(job.state_reason, Some(StateReason::FailBurstBufferOp));
        assert_eq!(job.state_desc.as_deref(), Some("Could not find burst buffer record"));
    }

    #[test]
    fn test_begin_before_stage_in_is_rejected() {
        let (controller, _) = controller();
        let job = bb_job(6);
        controller.validate2(&job).unwrap();

        let err = controller.begin(&job).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::StageInIncomplete {
                state: BbState::Pending,
                ..
            }
        ));
    }

    #[test]
    fn test_cancel_pending_completes_without_worker() {
        let (controller, _) = controller();
        let job = bb_job(7);
        controller.validate2(&job).unwrap();

        controller.cancel(&job).unwrap();
        controller.cancel(&job).unwrap();

        assert_eq!(controller.record_state(job.job_id), Some(BbState::Complete));
        assert_eq!(controller.active_workers(), 0);
    }

    #[test]
    fn test_reap_keeps_pending_jobs() {
        let (controller, scheduler) = controller();
        let done = bb_job(8);
        let requeued = bb_job(9);
        scheduler.insert(requeued.clone());
        for job in [&done, &requeued] {
            controller.validate2(job).unwrap();
            controller.cancel(job).unwrap();
        }

        assert_eq!(controller.reap(), 1);
        assert!(controller.record(done.job_id).is_none());
        assert!(controller.record(requeued.job_id).is_some());
        assert!(controller.purge(requeued.job_id));
    }

    #[test]
    fn test_status_lists_records() {
        let (controller, _) = controller();
        controller.validate2(&bb_job(10)).unwrap();

        let status = controller.status();
        assert!(status.starts_with("burst_buffer/lod: 1 records"));
        assert!(status.contains("JobId=10 state=pending phases=setup,teardown"));
        assert_eq!(controller.state_pack()[0].state, BbState::Pending);
    }

    #[test]
    fn test_validate_script() {
        let (controller, _) = controller();
        assert!(controller.validate("#!/bin/sh\necho hi\n").unwrap().is_none());

        let script = "#!/bin/sh\n#LOD setup node=cn01 mdtdevs=/dev/sdb ostdevs=/dev/sdc\n";
        let spec = controller.validate(script).unwrap().unwrap();
        let RequestSpec::Lod(request) = spec;
        assert!(request.setup);

        let bad = "#!/bin/sh\n#LOD stop\n";
        assert!(matches!(
            controller.validate(bad),
            Err(ControllerError::Directive(_))
        ));
    }

    #[test]
    fn test_reconfig_swaps_config() {
        let (controller, _) = controller();
        let config = ControllerConfig {
            other_timeout_secs: Some(5),
            ..Default::default()
        };
        controller.reconfig(config.clone());
        assert_eq!(*controller.config(), config);
    }
}
