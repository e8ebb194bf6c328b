//! Aggregate transfer progress
//!
//! Byte counts are bumped concurrently by every writer under the shared side
//! of the progress lock. File counters change only together with a job status
//! transition, under the exclusive side, and snapshots take the exclusive side
//! so they see jobs and counters at one consistent point.

use crate::job::{JobStatus, TransferJob};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Bytes durably written
    pub bytes_transferred: u64,
    /// Jobs known to the transfer
    pub files_total: u64,
    /// Jobs finished
    pub files_transferred: u64,
    /// Jobs failed
    pub files_failed: u64,
    /// Jobs skipped
    pub files_skipped: u64,
}

impl ProgressSnapshot {
    /// Jobs in a terminal or failed state
    pub fn files_done(&self) -> u64 {
        self.files_transferred + self.files_failed + self.files_skipped
    }
}

/// Counters guarded by the transfer's progress lock
#[derive(Debug, Default)]
pub struct ProgressTracker {
    bytes_transferred: AtomicU64,
    files_total: u64,
    files_transferred: u64,
    files_failed: u64,
    files_skipped: u64,
}

impl ProgressTracker {
    /// Count a newly added job in `status`
    pub fn add_job(&mut self, status: JobStatus) {
        self.files_total += 1;
        self.enter(status);
    }

    /// Apply the counter changes of one status transition
    pub fn record_transition(&mut self, from: JobStatus, to: JobStatus) {
        if from == JobStatus::Failed {
            self.files_failed = self.files_failed.saturating_sub(1);
        }
        self.enter(to);
    }

    fn enter(&mut self, status: JobStatus) {
        match status {
            JobStatus::Finished => self.files_transferred += 1,
            JobStatus::Failed => self.files_failed += 1,
            JobStatus::Skipped => self.files_skipped += 1,
            JobStatus::NotStarted | JobStatus::Transfer | JobStatus::Monitor => {}
        }
    }

    /// Add written bytes
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy of the counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            files_total: self.files_total,
            files_transferred: self.files_transferred,
            files_failed: self.files_failed,
            files_skipped: self.files_skipped,
        }
    }
}

/// The progress lock: a [`ProgressTracker`] behind a reader/writer lock.
#[derive(Debug, Default)]
pub struct TransferProgress {
    inner: RwLock<ProgressTracker>,
}

impl TransferProgress {
    /// Empty progress
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress rebuilt from restored jobs: counters from their statuses,
    /// bytes from their checkpoints.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a TransferJob>) -> Self {
        let mut tracker = ProgressTracker::default();
        for job in jobs {
            tracker.add_job(job.status);
            let bytes = match (job.status, job.total_length) {
                (JobStatus::Finished, Some(total)) => total,
                (_, Some(total)) => job.checkpoint.committed_bytes(total, job.block_size),
                (_, None) => 0,
            };
            tracker.add_bytes(bytes);
        }
        Self {
            inner: RwLock::new(tracker),
        }
    }

    /// Add written bytes under the shared side of the lock.
    pub fn add_bytes(&self, bytes: u64) {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .add_bytes(bytes);
    }

    /// Take the exclusive side of the lock.
    pub fn lock(&self) -> RwLockWriteGuard<'_, ProgressTracker> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of the counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot()
    }
}
