//! Scripted runner for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::job::JobId;

use super::process::shutdown_signal;
use super::{cancelled, CommandOutput, CommandRunner, ExitStatus, Invocation};

/// Scripted outcome for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Exit 0 with the given output.
    Succeed(String),
    /// Exit with `code` and the given output.
    Fail { code: i32, output: String },
    /// Block until cancelled or timed out.
    Hang,
    /// Succeed after a delay, unless cancelled first.
    Delay(Duration),
    /// Block until cancelled, then exit 0 anyway, like a tool that finishes
    /// its work before noticing the signal.
    SucceedOnCancel,
}

impl MockResponse {
    pub fn fail(code: i32, output: impl Into<String>) -> Self {
        Self::Fail {
            code,
            output: output.into(),
        }
    }
}

/// An invocation as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvocation {
    pub label: &'static str,
    pub job_id: JobId,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Default)]
struct MockState {
    queued: HashMap<&'static str, VecDeque<MockResponse>>,
    defaults: HashMap<&'static str, MockResponse>,
    invocations: Vec<RecordedInvocation>,
    running: HashMap<(JobId, &'static str), usize>,
    overlaps: usize,
}

/// Runner that never spawns processes.
///
/// Responses are looked up by invocation label: queued responses first, then
/// a per-label default, then success with empty output.
pub struct MockRunner {
    state: Mutex<MockState>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl MockRunner {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(MockState::default()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            shutdown_tx,
        }
    }

    /// Queue a one-shot response for the next invocation with `label`.
    pub fn push(&self, label: &'static str, response: MockResponse) {
        self.state()
            .queued
            .entry(label)
            .or_default()
            .push_back(response);
    }

    /// Response for every `label` invocation without a queued one.
    pub fn set_default(&self, label: &'static str, response: MockResponse) {
        self.state().defaults.insert(label, response);
    }

    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.state().invocations.clone()
    }

    /// Invocations with `label`, optionally restricted to one job.
    pub fn calls(&self, label: &str, job_id: Option<JobId>) -> usize {
        self.state()
            .invocations
            .iter()
            .filter(|inv| inv.label == label && job_id.is_none_or(|id| inv.job_id == id))
            .count()
    }

    /// Highest number of simultaneous invocations observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Times an invocation started while another with the same job and
    /// label was still running.
    pub fn overlapping_runs(&self) -> usize {
        self.state().overlaps
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, invocation: &Invocation) -> MockResponse {
        let mut guard = self.state();
        let state = &mut *guard;
        state.invocations.push(RecordedInvocation {
            label: invocation.label,
            job_id: invocation.job_id,
            program: invocation.program.clone(),
            args: invocation.args.clone(),
            timeout: invocation.timeout,
        });

        let running = state
            .running
            .entry((invocation.job_id, invocation.label))
            .or_default();
        *running += 1;
        if *running > 1 {
            state.overlaps += 1;
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let label = invocation.label;
        if let Some(response) = state.queued.get_mut(label).and_then(VecDeque::pop_front) {
            return response;
        }
        state
            .defaults
            .get(label)
            .cloned()
            .unwrap_or_else(|| MockResponse::Succeed(String::new()))
    }

    fn finish(&self, invocation: &Invocation) {
        let mut guard = self.state();
        let state = &mut *guard;
        let key = (invocation.job_id, invocation.label);
        if let Some(running) = state.running.get_mut(&key) {
            *running -= 1;
            if *running == 0 {
                state.running.remove(&key);
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, invocation: Invocation) -> CommandOutput {
        let started = Instant::now();
        if *self.shutdown_tx.borrow() {
            return CommandOutput::new(
                ExitStatus::LaunchFailed("runner shutting down".to_string()),
                "",
                started.elapsed(),
            );
        }

        let response = self.begin(&invocation);
        info!(
            job_id = %invocation.job_id,
            label = invocation.label,
            args = ?invocation.args,
            "[MOCK] running burst buffer command"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (status, output) = match response {
            MockResponse::Succeed(output) => (ExitStatus::Exited(0), output),
            MockResponse::Fail { code, output } => (ExitStatus::Exited(code), output),
            MockResponse::Hang => tokio::select! {
                _ = tokio::time::sleep(invocation.timeout) => {
                    (ExitStatus::TimedOut(invocation.timeout), String::new())
                }
                _ = cancelled(invocation.cancel.clone()) => (ExitStatus::Cancelled, String::new()),
                _ = shutdown_signal(&mut shutdown_rx) => (ExitStatus::Cancelled, String::new()),
            },
            MockResponse::Delay(delay) => tokio::select! {
                _ = tokio::time::sleep(delay.min(invocation.timeout)) => {
                    if delay > invocation.timeout {
                        (ExitStatus::TimedOut(invocation.timeout), String::new())
                    } else {
                        (ExitStatus::Exited(0), String::new())
                    }
                }
                _ = cancelled(invocation.cancel.clone()) => (ExitStatus::Cancelled, String::new()),
                _ = shutdown_signal(&mut shutdown_rx) => (ExitStatus::Cancelled, String::new()),
            },
            MockResponse::SucceedOnCancel => tokio::select! {
                _ = tokio::time::sleep(invocation.timeout) => {
                    (ExitStatus::TimedOut(invocation.timeout), String::new())
                }
                _ = cancelled(invocation.cancel.clone()) => (ExitStatus::Exited(0), String::new()),
                _ = shutdown_signal(&mut shutdown_rx) => (ExitStatus::Cancelled, String::new()),
            },
        };

        self.finish(&invocation);
        CommandOutput::new(status, output, started.elapsed())
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
