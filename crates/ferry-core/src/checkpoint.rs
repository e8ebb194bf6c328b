//! Per-object checkpoint and transfer window.
//!
//! A checkpoint records how far an object transfer has progressed:
//!
//! - `entry_transfer_offset`: every chunk starting below this offset has been
//!   claimed at some point; chunks at or above it have never been claimed.
//! - `transfer_window`: start offsets of claimed chunks that are not yet
//!   confirmed written. Each is one `block_size` wide (the last one clamped to
//!   the object length).
//!
//! Bytes below `entry_transfer_offset` that are not covered by a window entry
//! are durably transferred. On restart the window entries are reclaimed first,
//! in ascending order, before any new ground is claimed.
//!
//! All mutation happens under one short, I/O-free lock.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Persisted checkpoint fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// First offset that has never been claimed
    pub entry_transfer_offset: u64,
    /// Claimed but unconfirmed chunk offsets, ascending
    pub transfer_window: Vec<u64>,
}

impl CheckpointState {
    /// Whether any progress has been recorded
    #[must_use]
    pub fn has_progress(&self) -> bool {
        self.entry_transfer_offset > 0 || !self.transfer_window.is_empty()
    }

    /// Check every arithmetic invariant against the object's geometry.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::RestartableInfoCorrupted`] on the first
    /// violation. Nothing is ever repaired here.
    pub fn validate(&self, total_length: u64, block_size: u64) -> Result<()> {
        let corrupted = |msg: String| Err(TransferError::RestartableInfoCorrupted(msg));

        if block_size == 0 {
            return corrupted("block size is zero".into());
        }
        let entry = self.entry_transfer_offset;
        if entry > total_length {
            return corrupted(format!(
                "entry offset {entry} beyond object length {total_length}"
            ));
        }
        if entry % block_size != 0 && entry != total_length {
            return corrupted(format!(
                "entry offset {entry} not aligned to block size {block_size}"
            ));
        }
        if entry == 0 && !self.transfer_window.is_empty() {
            return corrupted("transfer window non-empty while entry offset is zero".into());
        }

        let mut previous: Option<u64> = None;
        for &offset in &self.transfer_window {
            if offset % block_size != 0 {
                return corrupted(format!(
                    "window offset {offset} not aligned to block size {block_size}"
                ));
            }
            if offset >= entry {
                return corrupted(format!(
                    "window offset {offset} not below entry offset {entry}"
                ));
            }
            if let Some(prev) = previous
                && offset <= prev
            {
                return corrupted(format!(
                    "window offsets out of order ({prev} then {offset})"
                ));
            }
            previous = Some(offset);
        }
        Ok(())
    }

    /// Bytes already confirmed transferred
    #[must_use]
    pub fn committed_bytes(&self, total_length: u64, block_size: u64) -> u64 {
        let in_flight: u64 = self
            .transfer_window
            .iter()
            .map(|&w| chunk_end(w, block_size, total_length).saturating_sub(w))
            .sum();
        self.entry_transfer_offset.saturating_sub(in_flight)
    }
}

/// End offset (exclusive) of the chunk starting at `offset`
#[inline]
#[must_use]
pub fn chunk_end(offset: u64, block_size: u64, total_length: u64) -> u64 {
    offset.saturating_add(block_size).min(total_length)
}

#[derive(Debug)]
struct WindowState {
    entry_transfer_offset: u64,
    transfer_window: BTreeSet<u64>,
    reclaim: VecDeque<u64>,
    total_length: u64,
}

/// Transfer window of one object, shared by every reader and writer task.
#[derive(Debug)]
pub struct SingleObjectCheckpoint {
    block_size: u64,
    max_window_size: usize,
    state: Mutex<WindowState>,
}

impl SingleObjectCheckpoint {
    /// Empty checkpoint for a fresh transfer
    pub fn new(block_size: u64, max_window_size: usize) -> Self {
        Self::restore(CheckpointState::default(), block_size, max_window_size)
    }

    /// Checkpoint rebuilt from persisted fields.
    ///
    /// Validation is deferred to [`begin`](Self::begin), once the object's
    /// length is known.
    pub fn restore(state: CheckpointState, block_size: u64, max_window_size: usize) -> Self {
        Self {
            block_size,
            max_window_size,
            state: Mutex::new(WindowState {
                entry_transfer_offset: state.entry_transfer_offset,
                transfer_window: state.transfer_window.into_iter().collect(),
                reclaim: VecDeque::new(),
                total_length: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // The critical sections below cannot panic midway, so a poisoned
        // guard still holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Chunk size of this checkpoint
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Bind the checkpoint to the object's length and queue every window entry
    /// for reclamation.
    ///
    /// `state` is the (possibly normalized) persisted state to run with.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::RestartableInfoCorrupted`] if `state` is
    /// inconsistent with `total_length`.
    pub fn begin(&self, state: CheckpointState, total_length: u64) -> Result<()> {
        state.validate(total_length, self.block_size)?;
        let mut guard = self.lock();
        guard.entry_transfer_offset = state.entry_transfer_offset;
        guard.transfer_window = state.transfer_window.iter().copied().collect();
        guard.reclaim = state.transfer_window.into_iter().collect();
        guard.total_length = total_length;
        Ok(())
    }

    /// Claim the next never-claimed chunk.
    ///
    /// Returns `None` when the window is full or the object is fully claimed;
    /// both are backpressure, not failures.
    pub fn claim_next_chunk(&self) -> Option<u64> {
        let mut guard = self.lock();
        if guard.transfer_window.len() >= self.max_window_size
            || guard.entry_transfer_offset >= guard.total_length
        {
            return None;
        }
        let offset = guard.entry_transfer_offset;
        guard.transfer_window.insert(offset);
        guard.entry_transfer_offset = chunk_end(offset, self.block_size, guard.total_length);
        Some(offset)
    }

    /// Take the oldest chunk left in flight by an interrupted run.
    pub fn reclaim_from_window(&self) -> Option<u64> {
        self.lock().reclaim.pop_front()
    }

    /// Number of chunks still waiting to be reclaimed
    #[must_use]
    pub fn pending_reclaims(&self) -> usize {
        self.lock().reclaim.len()
    }

    /// Confirm the chunk at `offset` as durably written.
    ///
    /// Returns whether the offset was in the window.
    pub fn commit(&self, offset: u64) -> bool {
        self.lock().transfer_window.remove(&offset)
    }

    /// Whether every chunk has been claimed and confirmed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let guard = self.lock();
        guard.transfer_window.is_empty() && guard.entry_transfer_offset >= guard.total_length
    }

    /// Number of chunks currently in the window
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.lock().transfer_window.len()
    }

    /// Deep copy of the persisted fields, taken under the window lock
    #[must_use]
    pub fn snapshot(&self) -> CheckpointState {
        let guard = self.lock();
        CheckpointState {
            entry_transfer_offset: guard.entry_transfer_offset,
            transfer_window: guard.transfer_window.iter().copied().collect(),
        }
    }
}
