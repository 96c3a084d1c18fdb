//! Per-job lock registry
//!
//! Serializes writers of one import job inside this process and cleans up
//! automatically via the RAII `JobLockGuard`. Writers in other processes are
//! caught by the version check on save.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type JobMutex = Arc<AsyncMutex<()>>;

/// Held while a job is being mutated. Dropping it releases the lock and
/// removes the registry entry once nobody else is waiting.
pub struct JobLockGuard {
    job_id: Uuid,
    registry: JobLocks,
    _held: OwnedMutexGuard<()>,
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.job_id);
    }
}

/// Thread-safe map of job id to its lock
#[derive(Clone, Default)]
pub struct JobLocks {
    locks: Arc<Mutex<HashMap<Uuid, JobMutex>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, job_id: Uuid) -> JobMutex {
        self.locks.lock().entry(job_id).or_default().clone()
    }

    /// Wait until the job is free, then hold it
    pub async fn lock(&self, job_id: Uuid) -> JobLockGuard {
        let mutex = self.entry(job_id);
        let held = mutex.lock_owned().await;
        JobLockGuard {
            job_id,
            registry: self.clone(),
            _held: held,
        }
    }

    /// Hold the job only if nobody else does
    pub fn try_lock(&self, job_id: Uuid) -> Option<JobLockGuard> {
        let mutex = self.entry(job_id);
        match mutex.try_lock_owned() {
            Ok(held) => Some(JobLockGuard {
                job_id,
                registry: self.clone(),
                _held: held,
            }),
            // The current holder's guard removes the entry
            Err(_) => None,
        }
    }

    #[cfg(test)]
    fn is_locked(&self, job_id: &Uuid) -> bool {
        self.locks
            .lock()
            .get(job_id)
            .map_or(false, |m| m.try_lock().is_err())
    }

    /// Drop the entry when the registry and the departing holder are the only
    /// references left
    fn release(&self, job_id: &Uuid) {
        let mut locks = self.locks.lock();
        if let Some(mutex) = locks.get(job_id) {
            if Arc::strong_count(mutex) <= 2 {
                locks.remove(job_id);
            }
        }
    }

    #[cfg(test)]
    fn contains(&self, job_id: &Uuid) -> bool {
        self.locks.lock().contains_key(job_id)
    }
}
