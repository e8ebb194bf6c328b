//! Chunk writer state machine
//!
//! Drains the shared offset → chunk map into a [`ChunkSink`]:
//!
//! ```text
//! Prepare ──► Write ──► Commit ──► Finished
//!    └──────────┴─────────┴──────► Error
//! ```
//!
//! - `Prepare` waits until the reader knows the object length, then sizes the
//!   destination.
//! - `Write` takes one staged chunk per unit, writes it, returns its buffers
//!   to the pool and confirms it in the checkpoint window. Chunks arrive in
//!   any order.
//! - `Commit` finalizes the sink once every chunk is confirmed.

use crate::checkpoint::{CheckpointState, SingleObjectCheckpoint};
use crate::error::{Result, TransferError};
use crate::limiter::ConcurrencyLimiter;
use crate::progress::TransferProgress;
use crate::scheduler::StateMachine;
use crate::shared::SharedTransferData;
use crate::source::ChunkSink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Writer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    /// Waiting for the object length, then preparing the sink
    Prepare = 0,
    /// Draining staged chunks
    Write = 1,
    /// Finalizing the sink
    Commit = 2,
    /// Every chunk written and the sink finalized
    Finished = 3,
    /// Stopped on error, cancellation or a failed reader
    Error = 4,
}

impl WriterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WriterState::Prepare,
            1 => WriterState::Write,
            2 => WriterState::Commit,
            3 => WriterState::Finished,
            _ => WriterState::Error,
        }
    }

    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        matches!(self, WriterState::Finished | WriterState::Error)
    }
}

/// Writer-side counterpart of the chunk reader
pub struct ChunkWriter {
    label: String,
    sink: Arc<dyn ChunkSink>,
    shared: Arc<SharedTransferData>,
    checkpoint: Arc<SingleObjectCheckpoint>,
    progress: Arc<TransferProgress>,
    limiter: Arc<ConcurrencyLimiter>,
    cancel: CancellationToken,
    resume: Option<CheckpointState>,
    state: AtomicU8,
    written: AtomicU64,
    error: Mutex<Option<TransferError>>,
}

impl ChunkWriter {
    /// Writer draining `shared` into `sink`.
    ///
    /// `resume` is the checkpoint of an earlier run; the sink keeps the
    /// chunks it confirmed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: String,
        sink: Arc<dyn ChunkSink>,
        shared: Arc<SharedTransferData>,
        checkpoint: Arc<SingleObjectCheckpoint>,
        progress: Arc<TransferProgress>,
        limiter: Arc<ConcurrencyLimiter>,
        cancel: CancellationToken,
        resume: Option<CheckpointState>,
    ) -> Self {
        Self {
            label,
            sink,
            shared,
            checkpoint,
            progress,
            limiter,
            cancel,
            resume,
            state: AtomicU8::new(WriterState::Prepare as u8),
            written: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bytes written by this run
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Take the error that stopped the writer, if any
    pub fn take_error(&self) -> Option<TransferError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn advance(&self, from: WriterState, to: WriterState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!("{}: {:?} -> {:?}", self.label, from, to);
        }
        moved
    }

    fn terminate(&self, target: WriterState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if WriterState::from_u8(current).is_terminal() {
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
            "{}: {:?} -> {:?} ({} bytes written)",
            self.label,
            WriterState::from_u8(current),
            target,
            self.bytes_written()
        );
        if target == WriterState::Error {
            // Unwritten chunks stay in the window and are reclaimed on resume
            self.shared.clear();
        }
        self.shared.writer_done().signal();
        true
    }

    fn fail(&self, err: TransferError) {
        tracing::debug!("{}: stopping: {}", self.label, err);
        {
            let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.terminate(WriterState::Error);
        self.shared.fail();
    }

    async fn prepare(&self) -> Result<()> {
        let Some(total) = self.shared.total_length() else {
            return Ok(());
        };
        self.sink
            .prepare(total, self.shared.block_size(), self.resume.as_ref())
            .await
            .map_err(|e| TransferError::Sink(format!("{}: prepare: {e}", self.label)))?;
        if self.advance(WriterState::Prepare, WriterState::Write) {
            self.shared.writer_signal().raise();
        }
        Ok(())
    }

    async fn write(&self) -> Result<()> {
        if let Some(data) = self.shared.take_any() {
            if self.shared.staged() > 0 {
                self.shared.writer_signal().raise();
            }

            let mut offset = data.start_offset;
            for slice in data.slices() {
                self.sink
                    .write_at(offset, slice)
                    .await
                    .map_err(|e| TransferError::Sink(format!("{}: write at {offset}: {e}", self.label)))?;
                offset += slice.len() as u64;
            }
            let start = data.start_offset;
            let length = u64::from(data.length);
            drop(data);

            self.checkpoint.commit(start);
            self.written.fetch_add(length, Ordering::AcqRel);
            self.progress.add_bytes(length);
            self.limiter.signal_progress();
            // A window slot is free again
            self.shared.reader_signal().raise();
            tracing::trace!("{}: wrote chunk at {} ({} bytes)", self.label, start, length);
        }

        if self.checkpoint.is_complete() && self.advance(WriterState::Write, WriterState::Commit) {
            self.shared.writer_signal().raise();
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.sink
            .finalize()
            .await
            .map_err(|e| TransferError::Sink(format!("{}: finalize: {e}", self.label)))?;
        self.terminate(WriterState::Finished);
        Ok(())
    }

    async fn step(&self) -> Result<()> {
        match self.state() {
            WriterState::Prepare => self.prepare().await,
            WriterState::Write => self.write().await,
            WriterState::Commit => self.commit().await,
            WriterState::Finished | WriterState::Error => Ok(()),
        }
    }
}

#[async_trait]
impl StateMachine for ChunkWriter {
    fn take_work(&self) -> bool {
        if self.state() == WriterState::Prepare
            && self.shared.total_length().is_none()
            && !self.shared.is_failed()
            && !self.cancel.is_cancelled()
        {
            return false;
        }
        self.shared.writer_signal().take()
    }

    async fn do_work(self: Arc<Self>) {
        if self.state().is_terminal() {
            return;
        }
        if self.shared.is_failed() {
            self.terminate(WriterState::Error);
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

impl std::fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWriter")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("bytes_written", &self.bytes_written())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::gate::WorkSignal;
    use crate::memory_pool::MemoryPool;
    use crate::shared::TransferData;
    use std::time::Duration;

    #[derive(Default)]
    struct VecSink {
        data: Mutex<Vec<u8>>,
        finalized: Mutex<bool>,
        fail_writes: bool,
    }

    #[async_trait]
    impl ChunkSink for VecSink {
        async fn prepare(
            &self,
            total_length: u64,
            _block_size: u64,
            _resume: Option<&CheckpointState>,
        ) -> std::result::Result<(), SourceError> {
            self.data.lock().unwrap().resize(total_length as usize, 0);
            Ok(())
        }

        async fn write_at(&self, offset: u64, data: &[u8]) -> std::result::Result<(), SourceError> {
            if self.fail_writes {
                return Err(SourceError::Other("disk full".into()));
            }
            let start = offset as usize;
            self.data.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        async fn finalize(&self) -> std::result::Result<(), SourceError> {
            *self.finalized.lock().unwrap() = true;
            Ok(())
        }
    }

    struct Harness {
        writer: Arc<ChunkWriter>,
        sink: Arc<VecSink>,
        shared: Arc<SharedTransferData>,
        checkpoint: Arc<SingleObjectCheckpoint>,
        progress: Arc<TransferProgress>,
        pool: MemoryPool,
    }

    fn harness(sink: VecSink, total: u64, block_size: u64) -> Harness {
        let sink = Arc::new(sink);
        let shared = Arc::new(SharedTransferData::new(
            block_size,
            WorkSignal::detached(),
            WorkSignal::detached(),
        ));
        let checkpoint = Arc::new(SingleObjectCheckpoint::new(block_size, 64));
        checkpoint.begin(CheckpointState::default(), total).unwrap();
        let progress = Arc::new(TransferProgress::new());
        let writer = Arc::new(ChunkWriter::new(
            "writer test".into(),
            Arc::clone(&sink) as Arc<dyn ChunkSink>,
            Arc::clone(&shared),
            Arc::clone(&checkpoint),
            Arc::clone(&progress),
            Arc::new(ConcurrencyLimiter::new(1, Duration::from_millis(10), None)),
            CancellationToken::new(),
            None,
        ));
        Harness {
            writer,
            sink,
            shared,
            checkpoint,
            progress,
            pool: MemoryPool::new(block_size as usize, 16),
        }
    }

    fn stage(h: &Harness, offset: u64, length: u32, fill: u8) {
        let mut buffers = h.pool.try_acquire(1).unwrap();
        buffers[0][..length as usize].fill(fill);
        assert!(h.shared.publish(TransferData {
            start_offset: offset,
            length,
            buffers,
        }));
    }

    async fn pump(h: &Harness) {
        for _ in 0..64 {
            if h.writer.take_work() {
                Arc::clone(&h.writer).do_work().await;
            }
        }
    }

    #[tokio::test]
    async fn test_waits_for_geometry() {
        let h = harness(VecSink::default(), 10, 4);
        assert!(!h.writer.take_work());
        h.shared.set_total_length(10);
        assert!(h.writer.take_work());
        Arc::clone(&h.writer).do_work().await;
        assert_eq!(h.writer.state(), WriterState::Write);
    }

    #[tokio::test]
    async fn test_drains_out_of_order_and_finalizes() {
        let h = harness(VecSink::default(), 10, 4);
        h.shared.set_total_length(10);
        let offsets: Vec<u64> = std::iter::from_fn(|| h.checkpoint.claim_next_chunk()).collect();
        assert_eq!(offsets, vec![0, 4, 8]);

        stage(&h, 8, 2, 3);
        stage(&h, 0, 4, 1);
        pump(&h).await;
        assert_eq!(h.writer.state(), WriterState::Write);
        assert_eq!(h.pool.outstanding(), 0);

        stage(&h, 4, 4, 2);
        pump(&h).await;
        assert_eq!(h.writer.state(), WriterState::Finished);
        assert!(*h.sink.finalized.lock().unwrap());
        assert_eq!(
            *h.sink.data.lock().unwrap(),
            vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3]
        );
        assert_eq!(h.progress.snapshot().bytes_transferred, 10);
        assert!(h.shared.writer_done().is_open());
    }

    #[tokio::test]
    async fn test_zero_length_object() {
        let h = harness(VecSink::default(), 0, 4);
        h.shared.set_total_length(0);
        pump(&h).await;
        assert_eq!(h.writer.state(), WriterState::Finished);
        assert!(*h.sink.finalized.lock().unwrap());
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_chunk_in_window() {
        let sink = VecSink {
            fail_writes: true,
            ..VecSink::default()
        };
        let h = harness(sink, 8, 4);
        h.shared.set_total_length(8);
        let first = h.checkpoint.claim_next_chunk().unwrap();
        stage(&h, first, 4, 9);
        pump(&h).await;

        assert_eq!(h.writer.state(), WriterState::Error);
        assert!(matches!(
            h.writer.take_error(),
            Some(TransferError::Sink(_))
        ));
        assert!(h.shared.is_failed());
        assert_eq!(h.checkpoint.snapshot().transfer_window, vec![0]);
        assert_eq!(h.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reader_failure_stops_writer() {
        let h = harness(VecSink::default(), 8, 4);
        h.shared.set_total_length(8);
        h.shared.fail();
        pump(&h).await;
        assert_eq!(h.writer.state(), WriterState::Error);
        assert!(h.writer.take_error().is_none());
    }
}
