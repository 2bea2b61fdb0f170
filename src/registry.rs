//! In-memory registry of running analysis jobs, at most one per cache key

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::models::CacheKey;

/// Where a job currently is in its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    DownloadStart,
    Downloading,
    DownloadComplete,
    AnalysisStart,
}

/// Live progress of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub stage: JobStage,
    pub message: String,
}

/// Handle to one in-flight job
#[derive(Debug)]
pub struct JobHandle {
    job_id: u64,
    key: CacheKey,
    started: AtomicBool,
    cancelled: AtomicBool,
    progress: Mutex<JobProgress>,
}

impl JobHandle {
    fn new(job_id: u64, key: CacheKey) -> Self {
        Self {
            job_id,
            key,
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            progress: Mutex::new(JobProgress {
                stage: JobStage::Queued,
                message: "Waiting for a free worker".to_string(),
            }),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Mark the job as executing. Returns `false` if it was cancelled while
    /// queued, in which case the worker must exit without side effects.
    pub fn mark_started(&self) -> bool {
        self.started.store(true, Ordering::SeqCst);
        !self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_progress(&self, stage: JobStage, message: impl Into<String>) {
        let mut progress = lock(&self.progress);
        progress.stage = stage;
        progress.message = message.into();
    }

    pub fn progress(&self) -> JobProgress {
        lock(&self.progress).clone()
    }
}

/// Result of [`JobRegistry::try_begin`]
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    AlreadyRunning(Arc<JobHandle>),
    Started(Arc<JobHandle>),
}

/// Result of [`JobRegistry::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started and will never run
    Cancelled,
    /// The job was already running; it was forgotten but keeps going
    Detached,
    NotFound,
}

/// Map from cache key to its single in-flight job.
///
/// Every operation holds one mutex for its whole duration.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<CacheKey, Arc<JobHandle>>>,
    next_job_id: AtomicU64,
}

/// Poisoning only means another thread panicked mid-update of plain data
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for `key` unless one is already active
    pub fn try_begin(&self, key: &CacheKey) -> BeginOutcome {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs.get(key) {
            return BeginOutcome::AlreadyRunning(existing.clone());
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Arc::new(JobHandle::new(job_id, key.clone()));
        jobs.insert(key.clone(), handle.clone());
        debug!("Registered job {} for {}", job_id, key);
        BeginOutcome::Started(handle)
    }

    /// Remove the job for `key` if it is still the one identified by `job_id`
    pub fn complete(&self, key: &CacheKey, job_id: u64) -> bool {
        let mut jobs = lock(&self.jobs);
        match jobs.get(key) {
            Some(handle) if handle.job_id == job_id => {
                jobs.remove(key);
                debug!("Completed job {} for {}", job_id, key);
                true
            }
            _ => false,
        }
    }

    /// Forget the job for `key`, stopping it if it has not started yet
    pub fn cancel(&self, key: &CacheKey) -> CancelOutcome {
        let mut jobs = lock(&self.jobs);
        let Some(handle) = jobs.remove(key) else {
            return CancelOutcome::NotFound;
        };

        handle.cancelled.store(true, Ordering::SeqCst);
        if handle.is_started() {
            debug!("Detached running job {} for {}", handle.job_id, key);
            CancelOutcome::Detached
        } else {
            debug!("Cancelled queued job {} for {}", handle.job_id, key);
            CancelOutcome::Cancelled
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<JobHandle>> {
        lock(&self.jobs).get(key).cloned()
    }

    pub fn is_active(&self, key: &CacheKey) -> bool {
        lock(&self.jobs).contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    /// Keys of all active jobs
    pub fn active_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = lock(&self.jobs).keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Per-key async locks that serialize workers writing the same cache entry.
///
/// A detached job still holds its key's lock, so a replacement job for the
/// same key only executes once the detached one has finished.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`
    pub async fn acquire(&self, key: &CacheKey) -> KeyLockGuard<'_> {
        let slot = lock(&self.locks).entry(key.clone()).or_default().clone();
        let guard = slot.clone().lock_owned().await;
        KeyLockGuard {
            owner: self,
            key: key.clone(),
            slot,
            guard: Some(guard),
        }
    }

    /// Keys with a holder or waiter
    pub fn held_count(&self) -> usize {
        lock(&self.locks).len()
    }
}

/// Releases the key on drop and forgets it once nobody else is waiting
pub struct KeyLockGuard<'a> {
    owner: &'a KeyLocks,
    key: CacheKey,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock(&self.owner.locks);
        // One reference in the map plus ours means no waiter is left
        let unused = matches!(locks.get(&self.key), Some(slot) if Arc::ptr_eq(slot, &self.slot))
            && Arc::strong_count(&self.slot) == 2;
        if unused {
            locks.remove(&self.key);
        }
    }
}
