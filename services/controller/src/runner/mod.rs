//! External command execution.
//!
//! Every provisioning step shells out to the `lod` tool through a
//! [`CommandRunner`]. Runs are bounded by a timeout and can be cancelled
//! per job through the [`CancelRegistry`].

mod mock;
mod process;
mod tracker;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::job::JobId;

pub use mock::{MockResponse, MockRunner, RecordedInvocation};
pub use process::ProcessRunner;
pub use tracker::{CancelRegistry, TrackedInvocation};

/// One external command to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Short name of the step, e.g. `setup` or `stage_out`.
    pub label: &'static str,
    pub job_id: JobId,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,

    /// Flips to `true` when the job's invocations are cancelled.
    pub cancel: Option<watch::Receiver<bool>>,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut(Duration),
    LaunchFailed(String),
    Cancelled,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::TimedOut(timeout) => write!(f, "timed out after {}s", timeout.as_secs()),
            Self::LaunchFailed(reason) => write!(f, "launch failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: ExitStatus,

    /// Combined stdout and stderr, trimmed.
    pub output: String,

    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn new(status: ExitStatus, output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status,
            output: output.into(),
            elapsed,
        }
    }
}

/// Runs external commands on behalf of workers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run an invocation to completion, timeout or cancellation.
    async fn run(&self, invocation: Invocation) -> CommandOutput;

    /// Number of invocations currently running.
    fn active_count(&self) -> usize;

    /// Cancel everything in flight and refuse new runs.
    fn shutdown(&self);
}

/// Resolve once `rx` reads `true`. Never resolves without a receiver.
pub(crate) async fn cancelled(rx: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = rx {
        if rx.wait_for(|flag| *flag).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Exited(3).to_string(), "exit status 3");
        assert_eq!(ExitStatus::Signaled(9).to_string(), "killed by signal 9");
        assert_eq!(
            ExitStatus::TimedOut(Duration::from_secs(300)).to_string(),
            "timed out after 300s"
        );
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Cancelled.success());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_flag() {
        let (tx, rx) = watch::channel(false);
        let wait = tokio::spawn(cancelled(Some(rx)));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_pends_without_receiver() {
        let result = tokio::time::timeout(Duration::from_millis(20), cancelled(None)).await;
        assert!(result.is_err());
    }
}
