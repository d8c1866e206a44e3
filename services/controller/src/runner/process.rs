//! Runner backed by real child processes.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{cancelled, CommandOutput, CommandRunner, ExitStatus, Invocation};

/// Spawns the external tool with `tokio::process`.
///
/// Children are killed when their invocation is cancelled, times out, or the
/// runner shuts down.
pub struct ProcessRunner {
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signaled(signal);
        }
    }
    ExitStatus::Exited(-1)
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !output.trim().is_empty() {
            output.push('\n');
        }
        output.push_str(&stderr);
    }
    output.trim().to_string()
}

pub(super) async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: Invocation) -> CommandOutput {
        let started = Instant::now();
        if *self.shutdown_tx.borrow() {
            return CommandOutput::new(
                ExitStatus::LaunchFailed("runner shutting down".to_string()),
                "",
                started.elapsed(),
            );
        }
        let _active = ActiveGuard::new(&self.active);

        info!(
            job_id = %invocation.job_id,
            label = invocation.label,
            program = %invocation.program.display(),
            args = ?invocation.args,
            timeout_secs = invocation.timeout.as_secs(),
            "running burst buffer command"
        );

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %invocation.job_id, label = invocation.label, error = %e, "failed to launch command");
                return CommandOutput::new(
                    ExitStatus::LaunchFailed(e.to_string()),
                    "",
                    started.elapsed(),
                );
            }
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Dropping the losing `wait_with_output` future drops the child,
        // which kills it.
        let (status, output) = tokio::select! {
            result = child.wait_with_output() => match result {
                Ok(out) => (exit_status(out.status), combine_output(&out.stdout, &out.stderr)),
                Err(e) => (ExitStatus::LaunchFailed(e.to_string()), String::new()),
            },
            _ = tokio::time::sleep(invocation.timeout) => {
                (ExitStatus::TimedOut(invocation.timeout), String::new())
            }
            _ = cancelled(invocation.cancel.clone()) => (ExitStatus::Cancelled, String::new()),
            _ = shutdown_signal(&mut shutdown_rx) => (ExitStatus::Cancelled, String::new()),
        };

        let elapsed = started.elapsed();
        debug!(
            job_id = %invocation.job_id,
            label = invocation.label,
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "burst buffer command finished"
        );

        CommandOutput::new(status, output, elapsed)
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_output() {
        assert_eq!(combine_output(b"ok\n", b""), "ok");
        assert_eq!(combine_output(b"", b"bad device\n"), "bad device");
        assert_eq!(combine_output(b"out", b"err"), "out\nerr");
    }
}
