//! Per-object state shared by the reader and the writer.
//!
//! Besides the offset → chunk staging map this carries the handshake between
//! the two machines: each side's work signal, a failure flag that makes the
//! other side short-circuit, and one completion gate per machine.

use crate::gate::{CountdownGate, WorkSignal};
use crate::memory_pool::PoolBuffer;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// A fully read chunk handed from the reader to the writer.
///
/// Owns its pool buffers; the reader never touches them after publishing.
#[derive(Debug)]
pub struct TransferData {
    /// Object offset of the first byte
    pub start_offset: u64,
    /// Chunk length in bytes
    pub length: u32,
    /// Buffers holding the bytes, in order; the last may be partly used
    pub buffers: Vec<PoolBuffer>,
}

impl TransferData {
    /// Iterate over the chunk's bytes buffer by buffer, trimmed to `length`.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut left = self.length as usize;
        self.buffers.iter().map(move |buf| {
            let take = left.min(buf.len());
            left -= take;
            &buf[..take]
        })
    }
}

/// Object geometry plus the offset → chunk staging map.
///
/// Readers only insert, the writer only removes; entries are never updated.
#[derive(Debug)]
pub struct SharedTransferData {
    total_length: OnceLock<u64>,
    block_size: u64,
    chunks: DashMap<u64, TransferData>,
    failed: AtomicBool,
    reader_signal: WorkSignal,
    writer_signal: WorkSignal,
    reader_done: CountdownGate,
    writer_done: CountdownGate,
}

impl SharedTransferData {
    /// Staging area for an object transferred in `block_size` chunks.
    ///
    /// The length is unknown until the reader has fetched the object's
    /// attributes.
    pub fn new(block_size: u64, reader_signal: WorkSignal, writer_signal: WorkSignal) -> Self {
        Self {
            total_length: OnceLock::new(),
            block_size,
            chunks: DashMap::new(),
            failed: AtomicBool::new(false),
            reader_signal,
            writer_signal,
            reader_done: CountdownGate::new(1),
            writer_done: CountdownGate::new(1),
        }
    }

    /// Object length, once known
    pub fn total_length(&self) -> Option<u64> {
        self.total_length.get().copied()
    }

    /// Record the object length and wake the writer. Only the first call counts.
    pub fn set_total_length(&self, total_length: u64) {
        let _ = self.total_length.set(total_length);
        self.writer_signal.raise();
    }

    /// Chunk size
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Publish a chunk and wake the writer.
    ///
    /// Returns `false`, leaving the map untouched, if a chunk at the same
    /// offset is already staged.
    pub fn publish(&self, data: TransferData) -> bool {
        let inserted = match self.chunks.entry(data.start_offset) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(data);
                true
            }
        };
        if inserted {
            self.writer_signal.raise();
        }
        inserted
    }

    /// Remove and return any staged chunk
    pub fn take_any(&self) -> Option<TransferData> {
        let offset = self.chunks.iter().next().map(|entry| *entry.key())?;
        self.chunks.remove(&offset).map(|(_, data)| data)
    }

    /// Whether a chunk is staged at `offset`
    pub fn contains(&self, offset: u64) -> bool {
        self.chunks.contains_key(&offset)
    }

    /// Number of staged chunks
    pub fn staged(&self) -> usize {
        self.chunks.len()
    }

    /// Drop every staged chunk, returning its buffers to the pool
    pub fn clear(&self) {
        self.chunks.clear();
    }

    /// Flag the object as failed and wake both machines so they stop.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.reader_signal.raise();
        self.writer_signal.raise();
    }

    /// Whether either side has failed
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Reader's work signal
    pub fn reader_signal(&self) -> &WorkSignal {
        &self.reader_signal
    }

    /// Writer's work signal
    pub fn writer_signal(&self) -> &WorkSignal {
        &self.writer_signal
    }

    /// Gate opened once the reader reaches a terminal state
    pub fn reader_done(&self) -> &CountdownGate {
        &self.reader_done
    }

    /// Gate opened once the writer reaches a terminal state
    pub fn writer_done(&self) -> &CountdownGate {
        &self.writer_done
    }
}
