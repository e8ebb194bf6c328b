//! Batch transfer orchestration
//!
//! A [`Transfer`] owns many object jobs fed by an external enumeration and
//! drives them through one scheduler, one memory pool and one concurrency
//! limiter. Each running job pairs a [`ChunkReader`] with a [`ChunkWriter`]
//! over a shared staging area.
//!
//! Job statuses and the file counters change together under the progress
//! lock; [`Transfer::snapshot`] takes the same lock, so a journal never shows
//! a status without its counter.

use crate::checkpoint::SingleObjectCheckpoint;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::gate::WorkSignal;
use crate::job::{JobId, JobStatus, TransferJob};
use crate::journal::TransferJournal;
use crate::limiter::{ConcurrencyLimiter, LimiterPermit};
use crate::location::TransferLocation;
use crate::memory_pool::MemoryPool;
use crate::progress::{ProgressSnapshot, TransferProgress};
use crate::reader::{ChunkReader, ReaderContext, ReaderState};
use crate::scheduler::{Scheduler, SchedulerHandle, StateMachine};
use crate::shared::SharedTransferData;
use crate::source::{ObjectSource, SinkFactory};
use crate::writer::ChunkWriter;
use crate::JOURNAL_FORMAT_VERSION;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A failed job in a [`TransferSummary`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Job identifier
    pub id: JobId,
    /// Source location
    pub source: String,
    /// Failure message
    pub error: String,
}

/// Outcome of [`Transfer::run`]
#[derive(Debug, Clone)]
pub struct TransferSummary {
    /// Counters after the run
    pub progress: ProgressSnapshot,
    /// Jobs still failed after the run
    pub failures: Vec<JobFailure>,
    /// Jobs never started because the batch was cancelled
    pub not_started: u64,
    /// Whether the batch token was cancelled
    pub cancelled: bool,
}

impl TransferSummary {
    /// Whether every job finished or was skipped
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.not_started == 0 && !self.cancelled
    }
}

struct LiveJob {
    checkpoint: Arc<SingleObjectCheckpoint>,
    reader: Arc<ChunkReader>,
}

struct JobSlot {
    job: Mutex<TransferJob>,
    live: Mutex<Option<LiveJob>>,
}

impl JobSlot {
    fn new(job: TransferJob) -> Self {
        Self {
            job: Mutex::new(job),
            live: Mutex::new(None),
        }
    }

    fn job(&self) -> MutexGuard<'_, TransferJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, Option<LiveJob>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The job with its checkpoint and attributes brought up to date
    fn current(&self) -> TransferJob {
        let mut job = self.job().clone();
        if let Some(live) = self.live().as_ref() {
            job.checkpoint = live.checkpoint.snapshot();
            if let Some(attrs) = live.reader.attributes() {
                job.total_length = Some(attrs.length);
                job.etag = attrs.etag.clone();
            }
        }
        job
    }

    /// Fold the live state into the job and forget it
    fn settle(&self) {
        let current = self.current();
        let mut job = self.job();
        job.checkpoint = current.checkpoint;
        job.total_length = current.total_length;
        job.etag = current.etag;
        drop(job);
        *self.live() = None;
    }
}

/// Move `slot` to `next` and update the counters, under the progress lock.
fn set_status(
    progress: &TransferProgress,
    slot: &JobSlot,
    next: JobStatus,
    error: Option<String>,
) -> Result<JobStatus> {
    let mut tracker = progress.lock();
    let mut job = slot.job();
    let previous = job.transition(next)?;
    if error.is_some() {
        job.last_error = error;
    }
    tracker.record_transition(previous, next);
    Ok(previous)
}

/// Everything a spawned job task needs
#[derive(Clone)]
struct JobRuntime {
    config: Arc<TransferConfig>,
    source: Arc<dyn ObjectSource>,
    sinks: Arc<dyn SinkFactory>,
    progress: Arc<TransferProgress>,
    pool: MemoryPool,
    limiter: Arc<ConcurrencyLimiter>,
    cancel: CancellationToken,
    scheduler: SchedulerHandle,
}

impl JobRuntime {
    async fn run(self, slot: Arc<JobSlot>, _permit: LimiterPermit) {
        let (id, source) = {
            let job = slot.job();
            (job.id, job.source.clone())
        };

        let result = self.execute(&slot).await;
        slot.settle();

        let transition = match result {
            Ok(()) => {
                tracing::info!("Job {} finished: {}", id.short(), source);
                set_status(&self.progress, &slot, JobStatus::Finished, None)
            }
            Err(err) if err.is_not_found() && self.config.skip_missing_sources => {
                tracing::info!("Job {} skipped: {}", id.short(), err);
                set_status(
                    &self.progress,
                    &slot,
                    JobStatus::Skipped,
                    Some(err.to_string()),
                )
            }
            Err(err) => {
                if matches!(err, TransferError::Cancelled) {
                    tracing::info!("Job {} cancelled: {}", id.short(), source);
                } else {
                    tracing::error!("Job {} failed: {}", id.short(), err);
                    if self.config.fail_fast {
                        tracing::warn!("Cancelling batch after failure of job {}", id.short());
                        self.cancel.cancel();
                    }
                }
                set_status(&self.progress, &slot, JobStatus::Failed, Some(err.to_string()))
            }
        };
        if let Err(err) = transition {
            tracing::error!("Job {}: {}", id.short(), err);
        }
    }

    async fn execute(&self, slot: &Arc<JobSlot>) -> Result<()> {
        set_status(&self.progress, slot, JobStatus::Transfer, None)?;
        let job = slot.job().clone();
        let label = format!("job {}", job.id.short());

        tracing::info!(
            "Job {}: {} -> {}{}",
            job.id.short(),
            job.source,
            job.destination,
            if job.is_resuming() { " (resuming)" } else { "" }
        );

        let wake = self.scheduler.wake();
        let checkpoint = Arc::new(SingleObjectCheckpoint::restore(
            job.checkpoint.clone(),
            job.block_size,
            self.config.max_window_size,
        ));
        let shared = Arc::new(SharedTransferData::new(
            job.block_size,
            WorkSignal::new(Arc::clone(&wake)),
            WorkSignal::new(wake),
        ));

        let reader = Arc::new(ChunkReader::new(ReaderContext {
            label: format!("{label} reader"),
            source: Arc::clone(&self.source),
            location: job.source.clone(),
            checkpoint: Arc::clone(&checkpoint),
            restored: job.checkpoint.clone(),
            prior_etag: job.etag.clone(),
            prior_length: job.total_length,
            shared: Arc::clone(&shared),
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        })?);
        let sink = self
            .sinks
            .open(&job.destination)
            .await
            .map_err(|e| TransferError::Sink(format!("{}: {e}", job.destination)))?;
        let writer = Arc::new(ChunkWriter::new(
            format!("{label} writer"),
            sink,
            Arc::clone(&shared),
            Arc::clone(&checkpoint),
            Arc::clone(&self.progress),
            Arc::clone(&self.limiter),
            self.cancel.clone(),
            job.is_resuming().then(|| job.checkpoint.clone()),
        ));

        *slot.live() = Some(LiveJob {
            checkpoint,
            reader: Arc::clone(&reader),
        });

        let submitted = self
            .scheduler
            .submit(Arc::clone(&reader) as Arc<dyn StateMachine>)
            && self
                .scheduler
                .submit(Arc::clone(&writer) as Arc<dyn StateMachine>);
        if !submitted {
            return Err(TransferError::InvalidState("scheduler has shut down".into()));
        }

        shared.reader_done().wait().await;
        if reader.state() == ReaderState::Finished && !shared.writer_done().is_open() {
            set_status(&self.progress, slot, JobStatus::Monitor, None)?;
        }
        shared.writer_done().wait().await;

        match reader.take_error().or_else(|| writer.take_error()) {
            Some(err) => Err(err),
            None if writer.state().is_terminal() && !shared.is_failed() => Ok(()),
            None => Err(TransferError::InvalidState(format!(
                "{label} stopped without an error"
            ))),
        }
    }
}

/// A batch of object transfers
pub struct Transfer {
    config: Arc<TransferConfig>,
    source: Arc<dyn ObjectSource>,
    sinks: Arc<dyn SinkFactory>,
    jobs: RwLock<Vec<Arc<JobSlot>>>,
    progress: Arc<TransferProgress>,
    pool: MemoryPool,
    limiter: Arc<ConcurrencyLimiter>,
    cancel: CancellationToken,
}

impl Transfer {
    /// Empty batch.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: TransferConfig,
        source: Arc<dyn ObjectSource>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool: MemoryPool::new(config.memory_buffer_size, config.memory_pool_buffers),
            limiter: Arc::new(ConcurrencyLimiter::from_config(&config)),
            config: Arc::new(config),
            source,
            sinks,
            jobs: RwLock::new(Vec::new()),
            progress: Arc::new(TransferProgress::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Rebuild a batch from a journal.
    ///
    /// Jobs caught mid-transfer are marked failed so the next run resumes
    /// them. Each job keeps the block size its checkpoint was recorded with.
    ///
    /// # Errors
    ///
    /// - [`TransferError::JournalVersionMismatch`] for another format version
    /// - [`TransferError::InvalidConfig`] if the pool cannot hold a recorded block
    pub fn restore(
        journal: TransferJournal,
        config: TransferConfig,
        source: Arc<dyn ObjectSource>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self> {
        if journal.format_version != JOURNAL_FORMAT_VERSION {
            return Err(TransferError::JournalVersionMismatch {
                expected: JOURNAL_FORMAT_VERSION,
                found: journal.format_version,
            });
        }
        let mut transfer = Self::new(config, source, sinks)?;

        let mut jobs = journal.jobs;
        for job in &mut jobs {
            transfer.check_block_size(job.block_size)?;
            if matches!(job.status, JobStatus::Transfer | JobStatus::Monitor) {
                job.status = JobStatus::Failed;
                job.last_error = Some("interrupted".into());
            }
        }
        transfer.progress = Arc::new(TransferProgress::from_jobs(&jobs));
        tracing::info!(
            "Restored transfer with {} jobs ({} to run)",
            jobs.len(),
            jobs.iter().filter(|j| j.status.needs_run()).count()
        );
        transfer.jobs = RwLock::new(jobs.into_iter().map(|j| Arc::new(JobSlot::new(j))).collect());
        Ok(transfer)
    }

    fn check_block_size(&self, block_size: u64) -> Result<()> {
        if block_size == 0 || self.pool.buffers_for(block_size) > self.pool.capacity() {
            return Err(TransferError::InvalidConfig(format!(
                "memory pool of {} x {} bytes cannot hold a {block_size} byte block",
                self.pool.capacity(),
                self.pool.buffer_size()
            )));
        }
        Ok(())
    }

    fn slots(&self) -> Vec<Arc<JobSlot>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Add one object transfer; adding the same pair twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::UnsupportedLocation`] if either side is a
    /// directory; enumeration happens before jobs are added.
    pub fn add_job(
        &self,
        source: TransferLocation,
        destination: TransferLocation,
    ) -> Result<JobId> {
        if source.is_directory() || destination.is_directory() {
            return Err(TransferError::UnsupportedLocation(format!(
                "{source} -> {destination}: jobs copy single objects"
            )));
        }
        let job = TransferJob::new(source, destination, self.config.block_size);
        let id = job.id;

        let mut tracker = self.progress.lock();
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.iter().any(|slot| slot.job().id == id) {
            return Ok(id);
        }
        tracker.add_job(job.status);
        tracing::debug!("Added job {}: {} -> {}", id.short(), job.source, job.destination);
        jobs.push(Arc::new(JobSlot::new(job)));
        Ok(id)
    }

    /// Token cancelling the whole batch
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the batch; running jobs stop claiming work and fail as cancelled
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current counters
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Status of one job
    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        self.slots()
            .iter()
            .map(|slot| slot.job())
            .find(|job| job.id == id)
            .map(|job| job.status)
    }

    /// Journal of the whole batch, consistent under the progress lock
    pub fn snapshot(&self) -> TransferJournal {
        let tracker = self.progress.lock();
        let jobs = self.slots().iter().map(|slot| slot.current()).collect();
        TransferJournal::new(jobs, tracker.snapshot())
    }

    /// Run every job that is not finished or skipped.
    ///
    /// Per-job failures are recorded on the jobs and in the summary; they do
    /// not fail the run unless `fail_fast` cancels the batch.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::StuckTransfer`] when the limiter's stuck
    /// timeout fires; the batch is cancelled first.
    pub async fn run(&self) -> Result<TransferSummary> {
        let (scheduler, scheduler_task) =
            Scheduler::new(self.config.effective_workers(), self.pool.clone()).start();
        let runtime = JobRuntime {
            config: Arc::clone(&self.config),
            source: Arc::clone(&self.source),
            sinks: Arc::clone(&self.sinks),
            progress: Arc::clone(&self.progress),
            pool: self.pool.clone(),
            limiter: Arc::clone(&self.limiter),
            cancel: self.cancel.clone(),
            scheduler,
        };

        let pending: Vec<Arc<JobSlot>> = self
            .slots()
            .into_iter()
            .filter(|slot| slot.job().status.needs_run())
            .collect();
        tracing::info!(
            "Running {} jobs with {} concurrent",
            pending.len(),
            self.limiter.ceiling()
        );

        let mut running = JoinSet::new();
        let mut outcome = Ok(());
        for slot in pending {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.limiter.pause_if_over_limit(&self.cancel).await {
                if !matches!(err, TransferError::Cancelled) {
                    self.cancel.cancel();
                    outcome = Err(err);
                }
                break;
            }
            let permit = self.limiter.start();
            running.spawn(runtime.clone().run(slot, permit));
        }

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                tracing::error!("Job task ended abnormally: {}", err);
            }
        }
        drop(runtime);
        if let Err(err) = scheduler_task.await {
            tracing::error!("Scheduler ended abnormally: {}", err);
        }
        outcome?;

        let summary = self.summary();
        tracing::info!(
            "Transfer done: {} finished, {} failed, {} skipped, {} bytes",
            summary.progress.files_transferred,
            summary.progress.files_failed,
            summary.progress.files_skipped,
            summary.progress.bytes_transferred
        );
        Ok(summary)
    }

    fn summary(&self) -> TransferSummary {
        let journal = self.snapshot();
        let failures = journal
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| JobFailure {
                id: job.id,
                source: job.source.display_name(),
                error: job.last_error.clone().unwrap_or_default(),
            })
            .collect();
        let not_started = journal
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::NotStarted)
            .count() as u64;
        TransferSummary {
            progress: journal.progress,
            failures,
            not_started,
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("jobs", &self.slots().len())
            .field("progress", &self.progress())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointState;
    use crate::error::SourceError;
    use crate::source::{ChunkSink, ObjectAttributes};
    use async_trait::async_trait;
    use dashmap::DashMap;

    /// Objects keyed by display name, bytes `i % 256`
    #[derive(Default)]
    struct Objects(DashMap<String, u64>);

    #[async_trait]
    impl ObjectSource for Objects {
        async fn fetch_attributes(
            &self,
            location: &TransferLocation,
        ) -> std::result::Result<ObjectAttributes, SourceError> {
            let length = *self
                .0
                .get(&location.display_name())
                .ok_or(SourceError::NotFound)?;
            Ok(ObjectAttributes {
                length,
                etag: Some(format!("len-{length}")),
                kind: "test".into(),
            })
        }

        async fn download_range(
            &self,
            _location: &TransferLocation,
            buf: &mut [u8],
            offset: u64,
        ) -> std::result::Result<(), SourceError> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = ((offset + i as u64) % 256) as u8;
            }
            Ok(())
        }
    }

    /// Sinks keeping written bytes per destination
    #[derive(Default)]
    struct Sinks(Arc<DashMap<String, Arc<MemSink>>>);

    #[derive(Default)]
    struct MemSink(Mutex<Vec<u8>>);

    #[async_trait]
    impl ChunkSink for MemSink {
        async fn prepare(
            &self,
            total: u64,
            _block_size: u64,
            _resume: Option<&CheckpointState>,
        ) -> std::result::Result<(), SourceError> {
            self.0.lock().unwrap().resize(total as usize, 0);
            Ok(())
        }

        async fn write_at(&self, offset: u64, data: &[u8]) -> std::result::Result<(), SourceError> {
            let start = offset as usize;
            self.0.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        async fn finalize(&self) -> std::result::Result<(), SourceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SinkFactory for Sinks {
        async fn open(
            &self,
            location: &TransferLocation,
        ) -> std::result::Result<Arc<dyn ChunkSink>, SourceError> {
            let sink = self
                .0
                .entry(location.display_name())
                .or_default()
                .clone();
            Ok(sink)
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            block_size: 4096,
            span_size: 4096 * 8,
            memory_buffer_size: 4096,
            memory_pool_buffers: 8,
            worker_count: 4,
            max_concurrent_jobs: 2,
            limiter_wake_interval_ms: 5,
            ..TransferConfig::default()
        }
    }

    fn setup(objects: &[(&str, u64)], config: TransferConfig) -> (Transfer, Arc<DashMap<String, Arc<MemSink>>>) {
        let source = Objects::default();
        for (name, len) in objects {
            source.0.insert((*name).to_string(), *len);
        }
        let sinks = Sinks::default();
        let written = Arc::clone(&sinks.0);
        let transfer = Transfer::new(config, Arc::new(source), Arc::new(sinks)).unwrap();
        (transfer, written)
    }

    #[tokio::test]
    async fn test_batch_copies_every_object() {
        let objects = [("/src/a", 10_000), ("/src/b", 0), ("/src/c", 40_000)];
        let (transfer, written) = setup(&objects, config());
        for (name, _) in &objects {
            transfer
                .add_job(
                    TransferLocation::local(*name),
                    TransferLocation::local(name.replace("/src", "/dst")),
                )
                .unwrap();
        }
        let summary = transfer.run().await.unwrap();
        assert!(summary.is_success(), "{summary:?}");
        assert_eq!(summary.progress.files_transferred, 3);
        assert_eq!(summary.progress.bytes_transferred, 50_000);

        let c = written.get("/dst/c").unwrap();
        let bytes = c.0.lock().unwrap();
        assert_eq!(bytes.len(), 40_000);
        assert!(bytes.iter().enumerate().all(|(i, b)| *b == (i % 256) as u8));
    }

    #[tokio::test]
    async fn test_missing_source_skipped_or_failed() {
        let skip = TransferConfig {
            skip_missing_sources: true,
            ..config()
        };
        let (transfer, _) = setup(&[], skip);
        let id = transfer
            .add_job(TransferLocation::local("/src/gone"), TransferLocation::local("/dst/gone"))
            .unwrap();
        let summary = transfer.run().await.unwrap();
        assert_eq!(transfer.job_status(id), Some(JobStatus::Skipped));
        assert_eq!(summary.progress.files_skipped, 1);

        let (transfer, _) = setup(&[], config());
        let id = transfer
            .add_job(TransferLocation::local("/src/gone"), TransferLocation::local("/dst/gone"))
            .unwrap();
        let summary = transfer.run().await.unwrap();
        assert_eq!(transfer.job_status(id), Some(JobStatus::Failed));
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].error.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_add_job_dedup_and_directory_rejected() {
        let (transfer, _) = setup(&[], config());
        let a = transfer
            .add_job(TransferLocation::local("/a"), TransferLocation::local("/b"))
            .unwrap();
        let again = transfer
            .add_job(TransferLocation::local("/a"), TransferLocation::local("/b"))
            .unwrap();
        assert_eq!(a, again);
        assert_eq!(transfer.progress().files_total, 1);

        let dir = TransferLocation::LocalDirectory {
            path: "/src".into(),
        };
        assert!(matches!(
            transfer.add_job(dir, TransferLocation::local("/dst")),
            Err(TransferError::UnsupportedLocation(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_marks_interrupted_jobs_failed() {
        let (transfer, _) = setup(&[], config());
        transfer
            .add_job(TransferLocation::local("/a"), TransferLocation::local("/b"))
            .unwrap();
        let mut journal = transfer.snapshot();
        journal.jobs[0].status = JobStatus::Monitor;
        journal.jobs[0].checkpoint = CheckpointState {
            entry_transfer_offset: 8192,
            transfer_window: vec![4096],
        };
        journal.jobs[0].total_length = Some(10_000);

        let restored = Transfer::restore(
            journal,
            config(),
            Arc::new(Objects::default()),
            Arc::new(Sinks::default()),
        )
        .unwrap();
        let snap = restored.snapshot();
        assert_eq!(snap.jobs[0].status, JobStatus::Failed);
        assert_eq!(snap.progress.files_failed, 1);
        assert_eq!(snap.progress.bytes_transferred, 4096);
    }

    #[tokio::test]
    async fn test_restore_rejects_oversized_block() {
        let (transfer, _) = setup(&[], config());
        transfer
            .add_job(TransferLocation::local("/a"), TransferLocation::local("/b"))
            .unwrap();
        let mut journal = transfer.snapshot();
        journal.jobs[0].block_size = 1 << 30;
        let result = Transfer::restore(
            journal,
            config(),
            Arc::new(Objects::default()),
            Arc::new(Sinks::default()),
        );
        assert!(matches!(result, Err(TransferError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_cancelled() {
        let (transfer, _) = setup(&[("/src/a", 100_000)], config());
        transfer
            .add_job(TransferLocation::local("/src/a"), TransferLocation::local("/dst/a"))
            .unwrap();
        transfer.cancel();
        let summary = transfer.run().await.unwrap();
        assert!(summary.cancelled);
        assert!(!summary.is_success());
    }
}
