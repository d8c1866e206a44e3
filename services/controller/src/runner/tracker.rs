//! Per-job tracking of in-flight invocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::job::JobId;

type Senders = HashMap<JobId, Vec<(u64, watch::Sender<bool>)>>;

/// Registry of cancellable invocations, keyed by job.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<Senders>>,
    next_id: Arc<AtomicU64>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new invocation for `job_id`.
    ///
    /// The invocation stays registered until the returned handle is dropped.
    pub fn register(&self, job_id: JobId) -> TrackedInvocation {
        let (tx, rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders().entry(job_id).or_default().push((id, tx));
        TrackedInvocation {
            job_id,
            id,
            receiver: rx,
            registry: self.inner.clone(),
        }
    }

    /// Signal every registered invocation of `job_id`. Returns how many.
    pub fn cancel_job(&self, job_id: JobId) -> usize {
        let senders = self.senders();
        let Some(entries) = senders.get(&job_id) else {
            return 0;
        };
        for (_, tx) in entries {
            tx.send_replace(true);
        }
        debug!(job_id = %job_id, count = entries.len(), "cancelled burst buffer invocations");
        entries.len()
    }

    /// Number of registered invocations for `job_id`.
    pub fn active(&self, job_id: JobId) -> usize {
        self.senders().get(&job_id).map_or(0, Vec::len)
    }

    fn senders(&self) -> MutexGuard<'_, Senders> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration handle for one invocation.
pub struct TrackedInvocation {
    job_id: JobId,
    id: u64,
    receiver: watch::Receiver<bool>,
    registry: Arc<Mutex<Senders>>,
}

impl TrackedInvocation {
    /// Receiver to hand to the runner.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

impl Drop for TrackedInvocation {
    fn drop(&mut self) {
        let mut senders = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = senders.get_mut(&self.job_id) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                senders.remove(&self.job_id);
            }
        }
    }
}
