//! Chunk reader state machine
//!
//! One reader per object. It runs
//!
//! ```text
//! FetchAttributes ──► [GetRanges ──►] Download ──► Finished
//!        └───────────────┴──────────────┴────────► Error
//! ```
//!
//! where `GetRanges` only exists for the range-based flavor. Each scheduler
//! dispatch runs one unit of work:
//!
//! - `FetchAttributes`: one attribute fetch, resume-state validation,
//!   normalization and checkpoint binding.
//! - `GetRanges`: one span listing. The unit that lists the last span runs
//!   reconciliation and moves the reader to `Download`.
//! - `Download`: either one queued range of an in-flight chunk, or a new chunk
//!   (buffers first, then a claim on the checkpoint, then its first range).
//!   The range that completes a chunk publishes it into the shared map.
//!
//! A unit raises the reader's work signal as soon as it knows more work
//! exists, before awaiting its own I/O. The scheduler still dispatches at most
//! one unit per raise; re-raising early is what lets the ranges of one chunk
//! download concurrently into their shared buffers.

use crate::checkpoint::{CheckpointState, SingleObjectCheckpoint, chunk_end};
use crate::config::{TestHooks, TransferConfig};
use crate::error::{Result, TransferError};
use crate::gate::CountdownGate;
use crate::location::TransferLocation;
use crate::memory_pool::{MemoryPool, PoolBuffer};
use crate::range::{Range, RangesSpan, normalize_extents};
use crate::reconciler::{ChunkPlan, RangeReconciler};
use crate::scheduler::StateMachine;
use crate::shared::{SharedTransferData, TransferData};
use crate::source::{ObjectAttributes, ObjectSource, zero_fill};
use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio_util::sync::CancellationToken;

/// How a reader discovers what to download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderFlavor {
    /// Every chunk is read in full
    Sequential,
    /// Sparse ranges are listed first; holes are zero-filled without I/O
    RangeBased,
}

impl ReaderFlavor {
    /// Range-based when both the location kind and the source support
    /// range discovery.
    pub fn select(location: &TransferLocation, source: &dyn ObjectSource) -> Self {
        if location.supports_range_discovery() && source.supports_ranges() {
            ReaderFlavor::RangeBased
        } else {
            ReaderFlavor::Sequential
        }
    }
}

/// Reader states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    /// Fetching length and ETag
    FetchAttributes = 0,
    /// Listing sparse ranges span by span
    GetRanges = 1,
    /// Reading chunks
    Download = 2,
    /// Every chunk published
    Finished = 3,
    /// Stopped on error, cancellation or a failed writer
    Error = 4,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReaderState::FetchAttributes,
            1 => ReaderState::GetRanges,
            2 => ReaderState::Download,
            3 => ReaderState::Finished,
            _ => ReaderState::Error,
        }
    }

    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        matches!(self, ReaderState::Finished | ReaderState::Error)
    }
}

/// What the download phase reads for each chunk
#[derive(Debug, Clone)]
pub enum DownloadPlan {
    /// Every chunk is one data range
    Dense {
        /// Object length
        total_length: u64,
        /// Chunk size
        block_size: u64,
    },
    /// Reconciled per-chunk ranges
    Sparse(ChunkPlan),
}

impl DownloadPlan {
    /// Ranges covering the chunk at `offset`
    pub fn ranges_for(&self, offset: u64) -> Option<Vec<Range>> {
        match self {
            DownloadPlan::Dense {
                total_length,
                block_size,
            } => (offset < *total_length).then(|| {
                let end = chunk_end(offset, *block_size, *total_length);
                vec![Range::new(offset, end - 1, true)]
            }),
            DownloadPlan::Sparse(plan) => plan.ranges_for(offset).map(<[Range]>::to_vec),
        }
    }
}

/// Everything a reader needs, assembled by the job that owns it.
pub struct ReaderContext {
    /// Label used in logs
    pub label: String,
    /// Source collaborator
    pub source: Arc<dyn ObjectSource>,
    /// Object to read
    pub location: TransferLocation,
    /// Window shared with the writer
    pub checkpoint: Arc<SingleObjectCheckpoint>,
    /// Persisted checkpoint the job started from
    pub restored: CheckpointState,
    /// ETag recorded with `restored`
    pub prior_etag: Option<String>,
    /// Object length recorded with `restored`
    pub prior_length: Option<u64>,
    /// Staging area shared with the writer
    pub shared: Arc<SharedTransferData>,
    /// Buffer pool
    pub pool: MemoryPool,
    /// Transfer configuration
    pub config: Arc<TransferConfig>,
    /// Cancellation token of the batch
    pub cancel: CancellationToken,
}

/// A claimed chunk whose ranges are being read.
struct PendingChunk {
    offset: u64,
    length: u64,
    buffers: Vec<tokio::sync::Mutex<Option<PoolBuffer>>>,
    remaining: AtomicUsize,
    published: AtomicBool,
}

impl PendingChunk {
    fn new(offset: u64, length: u64, buffers: Vec<PoolBuffer>, ranges: usize) -> Self {
        Self {
            offset,
            length,
            buffers: buffers
                .into_iter()
                .map(|buf| tokio::sync::Mutex::new(Some(buf)))
                .collect(),
            remaining: AtomicUsize::new(ranges),
            published: AtomicBool::new(false),
        }
    }

    /// Count one finished range; `true` for the range that completes the chunk
    fn finish_range(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Claim the right to publish; succeeds once per chunk
    fn claim_publish(&self) -> bool {
        self.published
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn take_buffers(&self) -> Vec<PoolBuffer> {
        let mut out = Vec::with_capacity(self.buffers.len());
        for slot in &self.buffers {
            if let Some(buf) = slot.lock().await.take() {
                out.push(buf);
            }
        }
        out
    }
}

/// One range of one pending chunk: the unit of download work.
struct RangeUnit {
    chunk: Arc<PendingChunk>,
    range: Range,
}

/// Chunk reader for one object
pub struct ChunkReader {
    label: String,
    flavor: ReaderFlavor,
    source: Arc<dyn ObjectSource>,
    location: TransferLocation,
    checkpoint: Arc<SingleObjectCheckpoint>,
    restored: CheckpointState,
    prior_etag: Option<String>,
    prior_length: Option<u64>,
    shared: Arc<SharedTransferData>,
    pool: MemoryPool,
    cancel: CancellationToken,
    reconciler: RangeReconciler,
    hooks: TestHooks,

    state: AtomicU8,
    attributes: OnceLock<ObjectAttributes>,
    spans: Mutex<Vec<RangesSpan>>,
    next_span: AtomicUsize,
    spans_gate: OnceLock<CountdownGate>,
    plan: OnceLock<DownloadPlan>,
    chunk_gate: OnceLock<CountdownGate>,
    pending: SegQueue<RangeUnit>,
    published: AtomicU64,
    error: Mutex<Option<TransferError>>,
}

impl ChunkReader {
    /// Build a reader; the flavor follows the location and the source.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::UnsupportedLocation`] for directory locations.
    pub fn new(ctx: ReaderContext) -> Result<Self> {
        if ctx.location.is_directory() {
            return Err(TransferError::UnsupportedLocation(format!(
                "cannot read {} as one object",
                ctx.location
            )));
        }
        let flavor = ReaderFlavor::select(&ctx.location, ctx.source.as_ref());
        let block_size = ctx.checkpoint.block_size();

        Ok(Self {
            label: ctx.label,
            flavor,
            source: ctx.source,
            location: ctx.location,
            checkpoint: ctx.checkpoint,
            restored: ctx.restored,
            prior_etag: ctx.prior_etag,
            prior_length: ctx.prior_length,
            shared: ctx.shared,
            pool: ctx.pool,
            cancel: ctx.cancel,
            reconciler: RangeReconciler::from_config(&ctx.config, block_size),
            hooks: ctx.config.test_hooks.clone(),
            state: AtomicU8::new(ReaderState::FetchAttributes as u8),
            attributes: OnceLock::new(),
            spans: Mutex::new(Vec::new()),
            next_span: AtomicUsize::new(0),
            spans_gate: OnceLock::new(),
            plan: OnceLock::new(),
            chunk_gate: OnceLock::new(),
            pending: SegQueue::new(),
            published: AtomicU64::new(0),
            error: Mutex::new(None),
        })
    }

    /// Current state
    pub fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reader flavor
    pub fn flavor(&self) -> ReaderFlavor {
        self.flavor
    }

    /// Attributes from the fetch, once done
    pub fn attributes(&self) -> Option<&ObjectAttributes> {
        self.attributes.get()
    }

    /// Chunks published so far
    pub fn published_chunks(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Take the error that stopped the reader, if any.
    ///
    /// A reader stopped because the writer failed has no error of its own.
    pub fn take_error(&self) -> Option<TransferError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn spans(&self) -> MutexGuard<'_, Vec<RangesSpan>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffers_per_chunk(&self) -> usize {
        self.pool.buffers_for(self.checkpoint.block_size())
    }

    fn advance(&self, from: ReaderState, to: ReaderState) -> Result<()> {
        match self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::debug!("{}: {:?} -> {:?}", self.label, from, to);
                Ok(())
            }
            Err(actual) if ReaderState::from_u8(actual).is_terminal() => Ok(()),
            Err(actual) => Err(TransferError::InvalidState(format!(
                "{}: expected {:?}, found {:?}",
                self.label,
                from,
                ReaderState::from_u8(actual)
            ))),
        }
    }

    /// Move to a terminal state; only the first call wins.
    fn terminate(&self, target: ReaderState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ReaderState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        tracing::debug!(
            "{}: {:?} -> {:?} ({} chunks published)",
            self.label,
            ReaderState::from_u8(current),
            target,
            self.published_chunks()
        );

        // Queued ranges hold pool buffers through their chunk
        while self.pending.pop().is_some() {}
        self.shared.reader_done().signal();
        self.shared.writer_signal().raise();
        true
    }

    fn fail(&self, err: TransferError) {
        match &err {
            TransferError::RestartableInfoCorrupted(msg) => {
                tracing::warn!("{}: resume state rejected: {}", self.label, msg);
            }
            other => tracing::debug!("{}: stopping: {}", self.label, other),
        }
        {
            let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.terminate(ReaderState::Error);
        self.shared.fail();
    }

    fn check_resume_state(&self, attrs: &ObjectAttributes) -> Result<()> {
        if !self.restored.has_progress() {
            return Ok(());
        }
        let corrupted = |msg: String| Err(TransferError::RestartableInfoCorrupted(msg));

        let Some(etag) = attrs.etag.as_deref() else {
            return corrupted(format!(
                "{} reports no ETag but a checkpoint exists",
                self.location
            ));
        };
        if let Some(prior) = self.prior_etag.as_deref()
            && prior != etag
        {
            return corrupted(format!(
                "{} changed since the checkpoint (ETag {prior} -> {etag})",
                self.location
            ));
        }
        if let Some(prior) = self.prior_length
            && prior != attrs.length
        {
            return corrupted(format!(
                "{} changed length since the checkpoint ({prior} -> {})",
                self.location, attrs.length
            ));
        }
        Ok(())
    }

    async fn fetch_attributes(&self) -> Result<()> {
        let attrs = self
            .source
            .fetch_attributes(&self.location)
            .await
            .map_err(|e| TransferError::from_source(e, &self.location.display_name()))?;

        self.check_resume_state(&attrs)?;
        let total = attrs.length;
        let state = self.reconciler.normalize(&self.restored, total)?;
        self.checkpoint.begin(state.clone(), total)?;

        tracing::debug!(
            "{}: {} bytes ({}), etag {:?}, entry offset {}, {} window chunks",
            self.label,
            total,
            attrs.kind,
            attrs.etag,
            state.entry_transfer_offset,
            state.transfer_window.len()
        );
        let _ = self.attributes.set(attrs);
        self.shared.set_total_length(total);

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        match self.flavor {
            ReaderFlavor::Sequential => {
                let block_size = self.checkpoint.block_size();
                let fresh = (total - state.entry_transfer_offset).div_ceil(block_size);
                let chunks = state.transfer_window.len() + fresh as usize;
                self.enter_download(
                    ReaderState::FetchAttributes,
                    DownloadPlan::Dense {
                        total_length: total,
                        block_size,
                    },
                    chunks,
                )
            }
            ReaderFlavor::RangeBased => {
                let spans = self.reconciler.plan_spans(&state, total);
                if spans.is_empty() {
                    return self.enter_download(
                        ReaderState::FetchAttributes,
                        DownloadPlan::Sparse(ChunkPlan::default()),
                        0,
                    );
                }
                let _ = self.spans_gate.set(CountdownGate::new(spans.len()));
                *self.spans() = spans;
                self.advance(ReaderState::FetchAttributes, ReaderState::GetRanges)?;
                self.shared.reader_signal().raise();
                Ok(())
            }
        }
    }

    async fn get_ranges(&self) -> Result<()> {
        let span_count = self.spans().len();
        let index = self.next_span.fetch_add(1, Ordering::AcqRel);
        if index >= span_count {
            return Ok(());
        }
        if index + 1 < span_count {
            self.shared.reader_signal().raise();
        }

        let (start, end) = {
            let spans = self.spans();
            (spans[index].start, spans[index].end)
        };
        let extents = self
            .source
            .list_ranges(&self.location, start, end - start + 1)
            .await
            .map_err(|e| TransferError::from_source(e, &self.location.display_name()))?;
        let ranges = normalize_extents(&extents, start, end);
        tracing::trace!(
            "{}: span [{}, {}] has {} data ranges",
            self.label,
            start,
            end,
            ranges.len()
        );
        self.spans()[index].ranges = Some(ranges);

        if self.spans_gate.get().is_some_and(CountdownGate::signal) {
            let spans = std::mem::take(&mut *self.spans());
            let plan = self.reconciler.reconcile(&spans)?;
            tracing::debug!(
                "{}: {} chunks planned, {} of them data bytes",
                self.label,
                plan.chunk_count(),
                plan.data_bytes()
            );
            let chunks = plan.chunk_count();
            self.enter_download(ReaderState::GetRanges, DownloadPlan::Sparse(plan), chunks)?;
        }
        Ok(())
    }

    fn enter_download(&self, from: ReaderState, plan: DownloadPlan, chunks: usize) -> Result<()> {
        let _ = self.plan.set(plan);
        let _ = self.chunk_gate.set(CountdownGate::new(chunks));
        if chunks == 0 {
            self.terminate(ReaderState::Finished);
            return Ok(());
        }
        self.advance(from, ReaderState::Download)?;
        self.shared.reader_signal().raise();
        Ok(())
    }

    async fn download(&self) -> Result<()> {
        if let Some(unit) = self.pending.pop() {
            if !self.pending.is_empty() || self.pool.can_acquire(self.buffers_per_chunk()) {
                self.shared.reader_signal().raise();
            }
            return self.run_unit(unit).await;
        }

        let Some(mut buffers) = self.pool.try_acquire(self.buffers_per_chunk()) else {
            tracing::trace!("{}: memory pool exhausted", self.label);
            // Stays raised; take_work holds it until buffers come back
            self.shared.reader_signal().raise();
            return Ok(());
        };
        let Some(offset) = self
            .checkpoint
            .reclaim_from_window()
            .or_else(|| self.checkpoint.claim_next_chunk())
        else {
            tracing::trace!("{}: nothing to claim", self.label);
            return Ok(());
        };

        let total = self.shared.total_length().ok_or_else(|| {
            TransferError::InvalidState(format!("{}: download before attributes", self.label))
        })?;
        let length = chunk_end(offset, self.checkpoint.block_size(), total) - offset;
        let ranges = self
            .plan
            .get()
            .and_then(|plan| plan.ranges_for(offset))
            .ok_or_else(|| {
                TransferError::InvalidState(format!(
                    "{}: chunk at {offset} missing from the plan",
                    self.label
                ))
            })?;
        buffers.truncate(self.pool.buffers_for(length));

        tracing::trace!(
            "{}: claimed chunk at {} ({} bytes, {} ranges)",
            self.label,
            offset,
            length,
            ranges.len()
        );
        let chunk = Arc::new(PendingChunk::new(offset, length, buffers, ranges.len()));
        let mut units = ranges.into_iter().map(|range| RangeUnit {
            chunk: Arc::clone(&chunk),
            range,
        });
        let first = units.next();
        for unit in units {
            self.pending.push(unit);
        }
        // Raised only once the ranges are queued, so a unit that takes the
        // signal sees them
        self.shared.reader_signal().raise();
        match first {
            Some(unit) => self.run_unit(unit).await,
            None => Ok(()),
        }
    }

    async fn run_unit(&self, unit: RangeUnit) -> Result<()> {
        if self.state() == ReaderState::Error || self.cancel.is_cancelled() {
            return Ok(());
        }
        let chunk = &unit.chunk;
        let buffer_size = self.pool.buffer_size() as u64;
        let rel_end = unit.range.end - chunk.offset + 1;
        let mut pos = unit.range.start - chunk.offset;

        while pos < rel_end {
            let index = (pos / buffer_size) as usize;
            let buf_start = index as u64 * buffer_size;
            let piece_end = rel_end.min(buf_start + buffer_size);

            let slot = chunk.buffers.get(index).ok_or_else(|| {
                TransferError::InvalidState(format!(
                    "{}: range past the buffers of chunk {}",
                    self.label, chunk.offset
                ))
            })?;
            let mut guard = slot.lock().await;
            let buf = guard.as_mut().ok_or_else(|| {
                TransferError::InvalidState(format!(
                    "{}: chunk {} written after publish",
                    self.label, chunk.offset
                ))
            })?;
            let piece = &mut buf[(pos - buf_start) as usize..(piece_end - buf_start) as usize];
            if unit.range.has_data {
                self.source
                    .download_range(&self.location, piece, chunk.offset + pos)
                    .await
                    .map_err(|e| TransferError::from_source(e, &self.location.display_name()))?;
            } else {
                zero_fill(piece);
            }
            pos = piece_end;
        }

        if chunk.finish_range() {
            self.publish(chunk).await?;
        }
        Ok(())
    }

    async fn publish(&self, chunk: &PendingChunk) -> Result<()> {
        if !chunk.claim_publish() || self.state() == ReaderState::Error {
            return Ok(());
        }
        let buffers = chunk.take_buffers().await;
        let length = u32::try_from(chunk.length).map_err(|_| {
            TransferError::InvalidState(format!("chunk length {} exceeds u32", chunk.length))
        })?;
        let data = TransferData {
            start_offset: chunk.offset,
            length,
            buffers,
        };
        if !self.shared.publish(data) {
            return Err(TransferError::InvalidState(format!(
                "{}: chunk at {} published twice",
                self.label, chunk.offset
            )));
        }
        let published = self.published.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(
            "{}: published chunk at {} ({} bytes)",
            self.label,
            chunk.offset,
            chunk.length
        );

        if let Some(limit) = self.hooks.fail_after_published_chunks
            && published >= limit
        {
            return Err(TransferError::Source(format!(
                "{}: injected failure after {published} chunks",
                self.location
            )));
        }
        if self.chunk_gate.get().is_some_and(CountdownGate::signal) {
            self.terminate(ReaderState::Finished);
        }
        Ok(())
    }

    async fn step(&self) -> Result<()> {
        match self.state() {
            ReaderState::FetchAttributes => self.fetch_attributes().await,
            ReaderState::GetRanges => self.get_ranges().await,
            ReaderState::Download => self.download().await,
            ReaderState::Finished | ReaderState::Error => Ok(()),
        }
    }
}

#[async_trait]
impl StateMachine for ChunkReader {
    fn take_work(&self) -> bool {
        if self.state() == ReaderState::Download
            && self.pending.is_empty()
            && !self.shared.is_failed()
            && !self.cancel.is_cancelled()
            && !self.pool.can_acquire(self.buffers_per_chunk())
        {
            return false;
        }
        self.shared.reader_signal().take()
    }

    async fn do_work(self: Arc<Self>) {
        if self.state().is_terminal() {
            return;
        }
        if self.shared.is_failed() {
            self.terminate(ReaderState::Error);
            return;
        }
        if self.cancel.is_cancelled() {
            self.fail(TransferError::Cancelled);
            return;
        }
        if let Err(err) = self.step().await {
            self.fail(err);
        }
    }

    fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("label", &self.label)
            .field("flavor", &self.flavor)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
