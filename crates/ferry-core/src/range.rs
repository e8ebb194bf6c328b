//! Byte ranges and range-listing spans

use crate::source::DataExtent;
use std::collections::BTreeMap;

/// A sub-extent of an object, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// First byte
    pub start: u64,
    /// Last byte (inclusive)
    pub end: u64,
    /// Whether the extent holds real data; `false` is transferred as zeros
    pub has_data: bool,
}

impl Range {
    /// Range covering `[start, end]`
    pub fn new(start: u64, end: u64, has_data: bool) -> Self {
        debug_assert!(start <= end);
        Self {
            start,
            end,
            has_data,
        }
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a range holds at least one byte
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A bounded window over the object used to batch range-listing calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangesSpan {
    /// First byte of the span
    pub start: u64,
    /// Last byte of the span (inclusive)
    pub end: u64,
    /// Data ranges inside the span, once listed
    pub ranges: Option<Vec<Range>>,
}

impl RangesSpan {
    /// Unlisted span covering `[start, end]`
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ranges: None,
        }
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a span holds at least one byte
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Clip raw listed extents to `[span_start, span_end]`, sort them and merge
/// overlapping or byte-adjacent ones.
pub fn normalize_extents(extents: &[DataExtent], span_start: u64, span_end: u64) -> Vec<Range> {
    let mut clipped: Vec<(u64, u64)> = extents
        .iter()
        .filter(|e| e.start <= e.end && e.end >= span_start && e.start <= span_end)
        .map(|e| (e.start.max(span_start), e.end.min(span_end)))
        .collect();
    clipped.sort_unstable();

    let mut merged: Vec<Range> = Vec::with_capacity(clipped.len());
    for (start, end) in clipped {
        match merged.last_mut() {
            Some(last) if start <= last.end.saturating_add(1) => {
                last.end = last.end.max(end);
            }
            _ => merged.push(Range::new(start, end, true)),
        }
    }
    merged
}

/// Append `next` to `acc`, merging a data range that continues byte-for-byte
/// across the seam into the previous one.
pub fn stitch(acc: &mut Vec<Range>, next: Vec<Range>) {
    let mut next = next.into_iter();
    if let Some(first) = next.next() {
        match acc.last_mut() {
            Some(last)
                if last.has_data && first.has_data && last.end.checked_add(1) == Some(first.start) =>
            {
                last.end = first.end;
            }
            _ => acc.push(first),
        }
    }
    acc.extend(next);
}

/// Cover `[seg_start, seg_end]` completely with ranges.
///
/// `data` must be sorted, disjoint and inside the segment. Gaps shorter than
/// `gap_threshold` that touch a data range are folded into it; longer gaps
/// become explicit `has_data = false` ranges. A segment without data yields a
/// single empty range.
pub fn fill_gaps(data: &[Range], seg_start: u64, seg_end: u64, gap_threshold: u64) -> Vec<Range> {
    if data.is_empty() {
        return vec![Range::new(seg_start, seg_end, false)];
    }

    let mut out: Vec<Range> = Vec::with_capacity(data.len() * 2 + 1);
    let mut cursor = seg_start;

    for range in data {
        if range.start > cursor {
            let gap = range.start - cursor;
            if gap < gap_threshold {
                // Absorb into the previous data range, or extend this one back
                match out.last_mut() {
                    Some(last) if last.has_data => {
                        last.end = range.end;
                        cursor = range.end.saturating_add(1);
                        continue;
                    }
                    _ => {
                        out.push(Range::new(cursor, range.end, true));
                        cursor = range.end.saturating_add(1);
                        continue;
                    }
                }
            }
            out.push(Range::new(cursor, range.start - 1, false));
        }
        match out.last_mut() {
            Some(last) if last.has_data && last.end.saturating_add(1) == range.start => {
                last.end = range.end;
            }
            _ => out.push(Range::new(range.start, range.end, true)),
        }
        cursor = range.end.saturating_add(1);
    }

    if cursor <= seg_end {
        let gap = seg_end - cursor + 1;
        match out.last_mut() {
            Some(last) if last.has_data && gap < gap_threshold => last.end = seg_end,
            _ => out.push(Range::new(cursor, seg_end, false)),
        }
    }
    out
}

/// Split ranges so that no piece crosses a multiple of `chunk_size`.
pub fn split_ranges(ranges: &[Range], chunk_size: u64) -> Vec<Range> {
    let mut pieces = Vec::with_capacity(ranges.len());
    for range in ranges {
        let mut start = range.start;
        loop {
            let boundary_end = (start / chunk_size + 1)
                .saturating_mul(chunk_size)
                .saturating_sub(1);
            let end = boundary_end.min(range.end);
            pieces.push(Range::new(start, end, range.has_data));
            if end >= range.end {
                break;
            }
            start = end + 1;
        }
    }
    pieces
}

/// Group block-aligned pieces by the start offset of their block.
pub fn group_by_block(pieces: Vec<Range>, block_size: u64) -> BTreeMap<u64, Vec<Range>> {
    let mut blocks: BTreeMap<u64, Vec<Range>> = BTreeMap::new();
    for piece in pieces {
        let block = piece.start - piece.start % block_size;
        blocks.entry(block).or_default().push(piece);
    }
    blocks
}
