//! In-memory job record store.
//!
//! A single mutex guards every record. Callers either use the snapshot
//! helpers or take a [`StoreGuard`] for a compound update. The guard is not
//! `Send`, so it cannot be held across an `.await` inside a spawned task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::ControllerError;
use crate::job::{JobId, JobInfo};
use crate::request::{Provisioning, ProvisioningRequest};

use super::record::{BbState, JobRecord};

#[derive(Default)]
struct StoreInner {
    records: HashMap<JobId, JobRecord>,
    last_update: Option<DateTime<Utc>>,
}

/// Owner of all burst buffer job records.
#[derive(Default)]
pub struct JobStateStore {
    inner: Mutex<StoreInner>,
    shutting_down: AtomicBool,
    next_generation: AtomicU64,
}

impl JobStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the store lock.
    pub fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            next_generation: &self.next_generation,
        }
    }

    /// Copy of the record for `job_id`.
    pub fn find(&self, job_id: JobId) -> Option<JobRecord> {
        self.lock().get(job_id).cloned()
    }

    /// Current state of the record for `job_id`.
    pub fn state(&self, job_id: JobId) -> Option<BbState> {
        self.lock().get(job_id).map(|record| record.state)
    }

    /// Copy of the record for `job`, creating it first if needed.
    ///
    /// Returns `None` when the job carries no burst buffer request.
    pub fn get_or_create(&self, job: &JobInfo) -> Option<JobRecord> {
        self.lock().get_or_create(job).map(|record| record.clone())
    }

    /// Run `f` on the record for `job_id` under the lock.
    pub fn with_record<R>(&self, job_id: JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        self.lock().get_mut(job_id).map(f)
    }

    pub fn remove(&self, job_id: JobId) -> Option<JobRecord> {
        self.lock().remove(job_id)
    }

    /// Copies of every record, ordered by job id.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let guard = self.lock();
        let mut records: Vec<JobRecord> = guard.records().cloned().collect();
        records.sort_by_key(|record| record.job_id);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of the last change that should wake the scheduler.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.lock().inner.last_update
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Drop every record.
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let count = guard.inner.records.len();
        guard.inner.records.clear();
        count
    }
}

/// Exclusive access to the record map.
pub struct StoreGuard<'a> {
    inner: MutexGuard<'a, StoreInner>,
    next_generation: &'a AtomicU64,
}

impl StoreGuard<'_> {
    pub fn get(&self, job_id: JobId) -> Option<&JobRecord> {
        self.inner.records.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut JobRecord> {
        self.inner.records.get_mut(&job_id)
    }

    /// Record for `job`, created in `Pending` if absent.
    ///
    /// The first caller creates the record; later callers get the same one.
    pub fn get_or_create(&mut self, job: &JobInfo) -> Option<&mut JobRecord> {
        if !self.inner.records.contains_key(&job.job_id) {
            let request = ProvisioningRequest::from_job(job)?;
            let generation = self.allocate_generation();
            debug!(
                job_id = %job.job_id,
                kind = ?request.spec.kind(),
                generation,
                "creating burst buffer record"
            );
            self.inner
                .records
                .insert(job.job_id, JobRecord::new(request, generation));
        }
        self.inner.records.get_mut(&job.job_id)
    }

    /// Reset the completed record of a requeued job to `Pending`.
    ///
    /// The record gets a fresh generation, so workers left over from the
    /// previous run can never act on it. Returns `Ok(false)` when there is no
    /// completed record to reset.
    pub fn requeue(&mut self, job: &JobInfo) -> Result<bool, ControllerError> {
        let request = match self.inner.records.get(&job.job_id) {
            Some(record) if record.state == BbState::Complete => ProvisioningRequest::from_job(job),
            _ => None,
        };
        let Some(request) = request else {
            return Ok(false);
        };
        let generation = self.allocate_generation();
        let Some(record) = self.inner.records.get_mut(&job.job_id) else {
            return Ok(false);
        };
        record.requeue(request, generation)?;
        debug!(job_id = %job.job_id, generation, "reset burst buffer record of requeued job");
        Ok(true)
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<JobRecord> {
        self.inner.records.remove(&job_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.inner.records.values()
    }

    /// Drop records matching `pred`, returning how many were removed.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&JobRecord) -> bool) -> usize {
        let before = self.inner.records.len();
        self.inner.records.retain(|_, record| !pred(record));
        before - self.inner.records.len()
    }

    /// Note a change the scheduler should react to.
    pub fn touch(&mut self) {
        self.inner.last_update = Some(Utc::now());
    }

    fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}
