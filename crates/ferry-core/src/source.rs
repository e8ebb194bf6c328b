//! Capability traits for the collaborators around the core
//!
//! The core never talks to a storage service directly. A source implements
//! [`ObjectSource`] and a destination implements [`ChunkSink`]; the reader and
//! writer state machines drive them.

use crate::checkpoint::CheckpointState;
use crate::error::SourceError;
use crate::location::TransferLocation;
use async_trait::async_trait;
use std::sync::Arc;

/// Attributes reported by a one-shot attribute fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Object length in bytes
    pub length: u64,
    /// Entity tag; `None` when the store does not version objects
    pub etag: Option<String>,
    /// Store-specific object kind, for logs
    pub kind: String,
}

/// A sparse "has data" extent reported by range listing (inclusive end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataExtent {
    /// First byte
    pub start: u64,
    /// Last byte (inclusive)
    pub end: u64,
}

impl DataExtent {
    /// Extent covering `[start, end]`
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Read side of an object store.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Fetch length, ETag and kind of the object at `location`.
    ///
    /// Must return [`SourceError::NotFound`] when the object is missing.
    async fn fetch_attributes(
        &self,
        location: &TransferLocation,
    ) -> Result<ObjectAttributes, SourceError>;

    /// Whether [`list_ranges`](Self::list_ranges) is meaningful for this source.
    fn supports_ranges(&self) -> bool {
        false
    }

    /// List the extents holding data within `[span_start, span_start + span_len)`.
    ///
    /// Extents may be returned unsorted and may exceed the span; the core
    /// clips and orders them.
    async fn list_ranges(
        &self,
        _location: &TransferLocation,
        _span_start: u64,
        _span_len: u64,
    ) -> Result<Vec<DataExtent>, SourceError> {
        Err(SourceError::Unsupported("list_ranges"))
    }

    /// Read `buf.len()` bytes starting at `offset` into `buf`.
    async fn download_range(
        &self,
        location: &TransferLocation,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), SourceError>;
}

/// Write side counterpart consuming published chunks.
///
/// Chunks arrive in any order; implementations must support random-access
/// writes and concurrent `write_at` calls on disjoint ranges.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Create or open the destination and size it to `total_length`.
    ///
    /// Chunks are `block_size` bytes except the last. `resume` is the
    /// checkpoint of an earlier run whose confirmed chunks are already in
    /// place: every chunk below its entry offset and outside its window. The
    /// sink must not discard them.
    async fn prepare(
        &self,
        total_length: u64,
        block_size: u64,
        resume: Option<&CheckpointState>,
    ) -> Result<(), SourceError>;

    /// Write `data` at `offset`.
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SourceError>;

    /// Flush and close the destination once every chunk is written.
    async fn finalize(&self) -> Result<(), SourceError>;
}

/// Opens the sink for each destination of a batch.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    /// Open a sink writing to `location`
    async fn open(&self, location: &TransferLocation) -> Result<Arc<dyn ChunkSink>, SourceError>;
}

/// Fill a buffer with zeros for a range without data. No I/O.
pub fn zero_fill(buf: &mut [u8]) {
    buf.fill(0);
}
