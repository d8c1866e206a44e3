//! Provisioning workers.
//!
//! One tokio task per job and phase. A worker holds only the job id and the
//! record generation it was spawned for, and re-reads the record through the
//! store lock before every mutation. Commands always run with the lock
//! released.

mod stage_in;
mod stage_out;
mod teardown;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::job::{JobId, StateReason};
use crate::request::{Phase, PLUGIN_TYPE};
use crate::runner::{CancelRegistry, CommandOutput, CommandRunner, ExitStatus, Invocation};
use crate::scheduler::JobScheduler;
use crate::state::{BbState, JobRecord, JobStateStore};

pub(crate) use stage_in::stage_in;
pub(crate) use stage_out::stage_out;
pub(crate) use teardown::teardown;

/// Longest command output copied into a job description.
const MAX_DESCRIPTION_OUTPUT: usize = 1024;

/// Kinds of worker tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    StageIn,
    StageOut,
    Teardown,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StageIn => "stage_in",
            Self::StageOut => "stage_out",
            Self::Teardown => "teardown",
        })
    }
}

/// The record a worker was spawned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerTarget {
    pub job_id: JobId,
    pub generation: u64,
}

impl WorkerTarget {
    pub fn of(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            generation: record.generation,
        }
    }
}

/// How a single phase ended from the worker's point of view.
#[derive(Debug)]
pub(crate) enum PhaseOutcome {
    /// The command exited 0, even if a cancel arrived while it ran.
    Succeeded,
    /// Failed with the description to show on the job.
    Failed(String),
    /// Cancelled before success, superseded, or shutting down. Nothing
    /// must be recorded.
    Abandoned,
}

/// Everything a worker needs, shared with the controller.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<JobStateStore>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub runner: Arc<dyn CommandRunner>,
    pub registry: CancelRegistry,
    pub config: Arc<ControllerConfig>,
}

impl WorkerContext {
    /// Run `f` on the target record if it still exists and is in `expected`.
    pub fn with_current<R>(
        &self,
        target: WorkerTarget,
        expected: BbState,
        f: impl FnOnce(&mut JobRecord) -> R,
    ) -> Option<R> {
        let mut guard = self.store.lock();
        match guard.get_mut(target.job_id) {
            Some(record) if record.generation == target.generation && record.state == expected => {
                Some(f(record))
            }
            Some(record) => {
                debug!(
                    job_id = %target.job_id,
                    state = %record.state,
                    expected = %expected,
                    "burst buffer record moved on, worker standing down"
                );
                None
            }
            None => {
                debug!(job_id = %target.job_id, "burst buffer record gone, worker standing down");
                None
            }
        }
    }

    /// Move the target record from `expected` to `next`.
    pub fn advance(&self, target: WorkerTarget, expected: BbState, next: BbState) -> bool {
        match self.with_current(target, expected, |record| record.transition(next)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(job_id = %target.job_id, error = %e, "burst buffer transition rejected");
                false
            }
            None => false,
        }
    }

    /// Run one phase of the external tool for the target record.
    pub async fn run_phase(&self, target: WorkerTarget, phase: Phase, expected: BbState) -> PhaseOutcome {
        let job_id = target.job_id;
        let tracked = self.registry.register(job_id);

        // Teardown is cleanup and proceeds without the job's node list.
        let job = self.scheduler.find_job(job_id);
        if job.is_none() && phase != Phase::Teardown {
            warn!(job_id = %job_id, phase = %phase, "job unknown to scheduler, abandoning burst buffer phase");
            return PhaseOutcome::Abandoned;
        }

        let Some(args) = self.with_current(target, expected, |record| {
            record.request.command_args(phase, job.as_ref())
        }) else {
            return PhaseOutcome::Abandoned;
        };

        let invocation = Invocation {
            label: phase.label(),
            job_id,
            program: self.config.lod_path.clone(),
            args,
            timeout: self.config.timeout_for(phase),
            cancel: Some(tracked.cancel_receiver()),
        };
        let output = self.runner.run(invocation).await;

        if self.store.is_shutting_down() {
            debug!(job_id = %job_id, phase = %phase, "shutting down, dropping burst buffer result");
            return PhaseOutcome::Abandoned;
        }

        // A command that completed has done its work even if a cancel raced
        // it; callers must still learn about the allocation it made.
        if output.status.success() {
            info!(
                job_id = %job_id,
                phase = %phase,
                elapsed_ms = output.elapsed.as_millis() as u64,
                cancelled = tracked.is_cancelled(),
                "burst buffer phase finished"
            );
            PhaseOutcome::Succeeded
        } else if tracked.is_cancelled() || output.status == ExitStatus::Cancelled {
            info!(job_id = %job_id, phase = %phase, "burst buffer phase cancelled");
            PhaseOutcome::Abandoned
        } else {
            error!(
                job_id = %job_id,
                phase = %phase,
                status = %output.status,
                output = %output.output,
                "burst buffer phase failed"
            );
            PhaseOutcome::Failed(failure_description(phase, &output))
        }
    }

    /// Mark the target record failed and surface `description` on the job.
    pub fn fail(&self, target: WorkerTarget, expected: BbState, description: String) {
        if !self.advance(target, expected, BbState::TeardownFail) {
            return;
        }
        self.scheduler
            .set_failure(target.job_id, StateReason::FailBurstBufferOp, description);
        self.store.lock().touch();
    }
}

fn failure_description(phase: Phase, output: &CommandOutput) -> String {
    let mut description = format!("{PLUGIN_TYPE}: {}: {}", phase.label(), output.status);
    if !output.output.is_empty() {
        description.push_str(": ");
        description.extend(output.output.chars().take(MAX_DESCRIPTION_OUTPUT));
    }
    description
}

type WorkerKey = (JobId, u64, WorkerKind);

/// A spawned task. `done` reports closed once the task finishes or is
/// aborted, because the task owns the only sender.
struct Worker {
    handle: JoinHandle<()>,
    done: watch::Receiver<()>,
}

impl Worker {
    fn start<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done) = watch::channel(());
        let handle = tokio::spawn(async move {
            let _done = done_tx;
            task.await;
        });
        Self { handle, done }
    }
}

/// Tracked worker tasks, at most one live task per record generation and
/// kind.
#[derive(Default)]
pub(crate) struct WorkerSet {
    tasks: Mutex<HashMap<WorkerKey, Worker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` unless a live task for the same record and kind exists.
    pub fn spawn<F>(&self, target: WorkerTarget, kind: WorkerKind, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.insert(target, kind, false, task)
    }

    /// Like [`WorkerSet::spawn`], but `task` starts only after every other
    /// live worker of the same job has finished.
    pub fn spawn_after_job<F>(&self, target: WorkerTarget, kind: WorkerKind, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.insert(target, kind, true, task)
    }

    fn insert<F>(&self, target: WorkerTarget, kind: WorkerKind, after_job: bool, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job_id = target.job_id;
        let key = (job_id, target.generation, kind);

        let mut tasks = self.tasks();
        tasks.retain(|_, worker| !worker.handle.is_finished());
        if tasks.contains_key(&key) {
            debug!(job_id = %job_id, kind = %kind, "worker already running");
            return false;
        }

        let earlier: Vec<watch::Receiver<()>> = if after_job {
            tasks
                .iter()
                .filter(|((id, _, _), _)| *id == job_id)
                .map(|(_, worker)| worker.done.clone())
                .collect()
        } else {
            Vec::new()
        };
        let waiting = earlier.len();

        let worker = Worker::start(async move {
            for mut done in earlier {
                // Only ever resolves with an error, once the sender is gone.
                let _ = done.changed().await;
            }
            task.await;
        });
        tasks.insert(key, worker);
        debug!(job_id = %job_id, kind = %kind, waiting, "spawned burst buffer worker");
        true
    }

    pub fn running_count(&self) -> usize {
        self.tasks()
            .values()
            .filter(|worker| !worker.handle.is_finished())
            .count()
    }

    /// Whether any generation of `job_id` has a live worker of `kind`.
    pub fn is_running(&self, job_id: JobId, kind: WorkerKind) -> bool {
        self.tasks()
            .iter()
            .any(|((id, _, k), worker)| *id == job_id && *k == kind && !worker.handle.is_finished())
    }

    /// Wait up to `timeout` for every task, then abort the rest.
    ///
    /// Returns the number of aborted tasks.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let mut workers: Vec<(WorkerKey, Worker)> = self.tasks().drain().collect();
        info!(count = workers.len(), "draining burst buffer workers");

        let joined = tokio::time::timeout(timeout, async {
            for ((job_id, _, kind), worker) in workers.iter_mut() {
                if let Err(e) = (&mut worker.handle).await {
                    warn!(job_id = %job_id, kind = %kind, error = %e, "burst buffer worker did not finish cleanly");
                }
            }
        })
        .await;
        if joined.is_ok() {
            return 0;
        }

        let mut aborted = 0;
        for ((job_id, _, kind), worker) in &workers {
            if !worker.handle.is_finished() {
                warn!(job_id = %job_id, kind = %kind, "force aborting burst buffer worker");
                worker.handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<WorkerKey, Worker>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
