//! Range reconciliation for sparse objects.
//!
//! Turns a checkpoint plus sparse "has data" metadata into the per-chunk
//! download plan of a range-based reader:
//!
//! 1. [`RangeReconciler::normalize`] folds window entries that sit directly
//!    below the entry offset back into unclaimed ground, shrinking what has to
//!    be listed.
//! 2. [`RangeReconciler::plan_spans`] cuts the unconfirmed regions (remaining
//!    window chunks, then everything from the entry offset on) into bounded
//!    spans, one listing call each.
//! 3. [`RangeReconciler::reconcile`] stitches listed spans, fills gaps (small
//!    ones become data), splits on block boundaries and groups the pieces per
//!    chunk.
//!
//! Confirmed chunks are never part of a span, so resumption never lists or
//! downloads acknowledged data again. The whole process is a pure function of
//! its inputs.

use crate::checkpoint::{CheckpointState, chunk_end};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::range::{Range, RangesSpan, fill_gaps, group_by_block, split_ranges, stitch};
use std::collections::BTreeMap;

/// Per-chunk download plan: chunk start offset → ranges covering the chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: BTreeMap<u64, Vec<Range>>,
}

impl ChunkPlan {
    /// Ranges covering the chunk at `offset`
    #[must_use]
    pub fn ranges_for(&self, offset: u64) -> Option<&[Range]> {
        self.chunks.get(&offset).map(Vec::as_slice)
    }

    /// Number of chunks in the plan
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the plan is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk offsets in ascending order
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.chunks.keys().copied()
    }

    /// Every planned range in offset order
    pub fn ranges(&self) -> impl Iterator<Item = &Range> + '_ {
        self.chunks.values().flatten()
    }

    /// Bytes that will be read from the source (the rest is zero-filled)
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        self.ranges().filter(|r| r.has_data).map(Range::len).sum()
    }
}

/// Range reconciler for one object geometry.
#[derive(Debug, Clone, Copy)]
pub struct RangeReconciler {
    block_size: u64,
    span_size: u64,
    merge_gap_threshold: u64,
}

impl RangeReconciler {
    /// Reconciler with explicit parameters; `span_size` is rounded down to
    /// whole blocks.
    pub fn new(block_size: u64, span_size: u64, merge_gap_threshold: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            span_size: (span_size / block_size).max(1) * block_size,
            merge_gap_threshold,
        }
    }

    /// Reconciler for `config`, using `block_size` (the checkpoint's) rather
    /// than the configured default.
    pub fn from_config(config: &TransferConfig, block_size: u64) -> Self {
        Self::new(block_size, config.span_size, config.merge_gap_threshold)
    }

    /// Validate `state` and fold trailing window entries contiguous with the
    /// entry offset back into unclaimed ground.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::RestartableInfoCorrupted`] when the state is
    /// inconsistent, including a window chunk reaching past the entry offset.
    pub fn normalize(&self, state: &CheckpointState, total_length: u64) -> Result<CheckpointState> {
        state.validate(total_length, self.block_size)?;

        let mut entry = state.entry_transfer_offset;
        let mut window = state.transfer_window.clone();
        while let Some(&last) = window.last() {
            let end = chunk_end(last, self.block_size, total_length);
            if end > entry {
                return Err(TransferError::RestartableInfoCorrupted(format!(
                    "window chunk [{last}, {end}) overlaps entry offset {entry}"
                )));
            }
            if end != entry {
                break;
            }
            window.pop();
            entry = last;
        }

        Ok(CheckpointState {
            entry_transfer_offset: entry,
            transfer_window: window,
        })
    }

    /// Spans to list for a normalized state, in ascending order.
    ///
    /// Contiguous window chunks share a span; unclaimed ground is cut into
    /// spans of at most the span size starting at the entry offset.
    #[must_use]
    pub fn plan_spans(&self, state: &CheckpointState, total_length: u64) -> Vec<RangesSpan> {
        let mut spans: Vec<RangesSpan> = Vec::new();

        for &offset in &state.transfer_window {
            let end = chunk_end(offset, self.block_size, total_length) - 1;
            match spans.last_mut() {
                Some(span) if span.end + 1 == offset && end - span.start < self.span_size => {
                    span.end = end;
                }
                _ => spans.push(RangesSpan::new(offset, end)),
            }
        }

        let mut start = state.entry_transfer_offset;
        while start < total_length {
            let end = start.saturating_add(self.span_size).min(total_length) - 1;
            spans.push(RangesSpan::new(start, end));
            start = end + 1;
        }
        spans
    }

    /// Build the chunk plan from listed spans.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] if a span was never listed or
    /// spans are out of order.
    pub fn reconcile(&self, spans: &[RangesSpan]) -> Result<ChunkPlan> {
        let mut chunks: BTreeMap<u64, Vec<Range>> = BTreeMap::new();

        // Contiguous spans form one segment so ranges can cross span seams
        let mut segment: Option<(u64, u64, Vec<Range>)> = None;
        for span in spans {
            let listed = span.ranges.clone().ok_or_else(|| {
                TransferError::InvalidState(format!(
                    "span [{}, {}] reconciled before listing",
                    span.start, span.end
                ))
            })?;

            let previous_end = segment.as_ref().map(|(_, end, _)| *end);
            if let Some(end) = previous_end
                && span.start <= end
            {
                return Err(TransferError::InvalidState(format!(
                    "span starting at {} overlaps previous span ending at {end}",
                    span.start
                )));
            }

            let contiguous = previous_end.map(|e| e + 1) == Some(span.start);
            if contiguous && let Some((_, seg_end, ranges)) = segment.as_mut() {
                stitch(ranges, listed);
                *seg_end = span.end;
            } else if let Some(done) = segment.replace((span.start, span.end, listed)) {
                self.emit_segment(done, &mut chunks);
            }
        }
        if let Some(done) = segment.take() {
            self.emit_segment(done, &mut chunks);
        }

        Ok(ChunkPlan { chunks })
    }

    fn emit_segment(
        &self,
        (seg_start, seg_end, data): (u64, u64, Vec<Range>),
        chunks: &mut BTreeMap<u64, Vec<Range>>,
    ) {
        let covered = fill_gaps(&data, seg_start, seg_end, self.merge_gap_threshold);
        let pieces = split_ranges(&covered, self.block_size);
        chunks.extend(group_by_block(pieces, self.block_size));
    }
}
