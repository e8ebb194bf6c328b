//! Positional-write file sink.
//!
//! Chunks arrive out of order and are written at their offsets into a file
//! pre-sized to the object length. A bitmap records which chunks are in place
//! (seeded from the checkpoint when resuming) so `finalize` can refuse an
//! incomplete file.

use crate::local::local_path;
use async_trait::async_trait;
use ferry_core::checkpoint::chunk_end;
use ferry_core::{CheckpointState, ChunkSink, SinkFactory, SourceError, TransferLocation};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, Default)]
struct Geometry {
    total_size: u64,
    block_size: u64,
    total_chunks: u64,
    /// Bitmap tracking received chunks (bit = 1 means received)
    chunk_bitmap: Vec<u64>,
    received_count: u64,
}

impl Geometry {
    fn new(total_size: u64, block_size: u64, resume: Option<&CheckpointState>) -> Self {
        let total_chunks = total_size.div_ceil(block_size.max(1));
        let mut geometry = Self {
            total_size,
            block_size,
            total_chunks,
            chunk_bitmap: vec![0u64; total_chunks.div_ceil(64) as usize],
            received_count: 0,
        };
        if let Some(state) = resume {
            geometry.seed(state);
        }
        geometry
    }

    /// Mark the chunks an earlier run confirmed
    fn seed(&mut self, state: &CheckpointState) {
        if self.block_size == 0 {
            return;
        }
        let confirmed = state.entry_transfer_offset.min(self.total_size);
        for idx in 0..confirmed.div_ceil(self.block_size) {
            let offset = idx * self.block_size;
            if state.transfer_window.binary_search(&offset).is_err() {
                self.mark(idx);
            }
        }
    }

    fn mark(&mut self, idx: u64) {
        if idx >= self.total_chunks {
            return;
        }
        let (word, bit) = ((idx / 64) as usize, idx % 64);
        if self.chunk_bitmap[word] & (1u64 << bit) == 0 {
            self.chunk_bitmap[word] |= 1u64 << bit;
            self.received_count += 1;
        }
    }

    /// Mark the chunk whose last byte is `end - 1`, if `end` closes a chunk
    fn record(&mut self, end: u64) {
        if end == 0 || self.block_size == 0 {
            return;
        }
        let idx = (end - 1) / self.block_size;
        if idx >= self.total_chunks
            || chunk_end(idx * self.block_size, self.block_size, self.total_size) != end
        {
            return;
        }
        self.mark(idx);
    }

    fn missing_count(&self) -> u64 {
        self.total_chunks - self.received_count
    }
}

/// Writes one object into a local file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    geometry: Mutex<Geometry>,
    bytes_written: AtomicU64,
}

impl FileSink {
    /// Sink writing to `path`; nothing is touched until `prepare`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            geometry: Mutex::new(Geometry::default()),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written by this run
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Chunks completed by this run
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.geometry().received_count
    }

    fn geometry(&self) -> std::sync::MutexGuard<'_, Geometry> {
        self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn prepare(
        &self,
        total_length: u64,
        block_size: u64,
        resume: Option<&CheckpointState>,
    ) -> Result<(), SourceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // An earlier run's chunks stay in place when resuming.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(resume.is_none())
            .open(&self.path)
            .await?;
        file.set_len(total_length).await?;
        *self.geometry() = Geometry::new(total_length, block_size, resume);
        tracing::debug!(
            "Prepared {} ({} bytes{})",
            self.path.display(),
            total_length,
            if resume.is_some() { ", resuming" } else { "" }
        );
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SourceError> {
        let end = offset + data.len() as u64;
        {
            let geometry = self.geometry();
            if end > geometry.total_size {
                return Err(SourceError::Other(format!(
                    "write [{offset}, {end}) past end of {} ({} bytes)",
                    self.path.display(),
                    geometry.total_size
                )));
            }
        }
        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        self.geometry().record(end);
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Sync the file once every chunk is in place.
    async fn finalize(&self) -> Result<(), SourceError> {
        let (total_size, missing) = {
            let g = self.geometry();
            (g.total_size, g.missing_count())
        };
        if missing > 0 {
            return Err(SourceError::Other(format!(
                "{} incomplete: {} chunks missing",
                self.path.display(),
                missing
            )));
        }
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len != total_size {
            return Err(SourceError::Other(format!(
                "{} has {} bytes, expected {}",
                self.path.display(),
                len,
                total_size
            )));
        }
        file.sync_all().await?;
        Ok(())
    }
}

/// Opens a [`FileSink`] per local destination
#[derive(Debug, Clone, Default)]
pub struct FileSinkFactory;

impl FileSinkFactory {
    /// Factory for local destinations
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn open(&self, location: &TransferLocation) -> Result<Arc<dyn ChunkSink>, SourceError> {
        let path = local_path(location)?;
        Ok(Arc::new(FileSink::new(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_out_of_order_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin");
        let data = pattern(10_000);
        let sink = FileSink::new(&path);
        sink.prepare(10_000, 4096, None).await.unwrap();

        for offset in [8192usize, 0, 4096] {
            let end = (offset + 4096).min(data.len());
            sink.write_at(offset as u64, &data[offset..end]).await.unwrap();
        }
        assert_eq!(sink.received_count(), 3);
        assert_eq!(sink.bytes_written(), 10_000);
        sink.finalize().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_chunk_split_over_writes_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out.bin"));
        sink.prepare(8192, 8192, None).await.unwrap();
        sink.write_at(0, &[1u8; 4096]).await.unwrap();
        assert_eq!(sink.received_count(), 0);
        sink.write_at(4096, &[2u8; 4096]).await.unwrap();
        assert_eq!(sink.received_count(), 1);
        sink.write_at(4096, &[2u8; 4096]).await.unwrap();
        assert_eq!(sink.received_count(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_finalize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out.bin"));
        sink.prepare(10_000, 4096, None).await.unwrap();
        sink.write_at(0, &[0u8; 4096]).await.unwrap();
        assert!(matches!(sink.finalize().await, Err(SourceError::Other(_))));
    }

    #[tokio::test]
    async fn test_resume_keeps_existing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data = pattern(8192);

        let first = FileSink::new(&path);
        first.prepare(8192, 4096, None).await.unwrap();
        first.write_at(0, &data[..4096]).await.unwrap();

        let confirmed = CheckpointState {
            entry_transfer_offset: 4096,
            transfer_window: vec![],
        };
        let second = FileSink::new(&path);
        second.prepare(8192, 4096, Some(&confirmed)).await.unwrap();
        assert_eq!(second.received_count(), 1);
        second.write_at(4096, &data[4096..]).await.unwrap();
        second.finalize().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resumed_finalize_still_checks_completeness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data = pattern(4096 * 3 + 10);

        // Chunk 0 is confirmed, chunk 4096 was in flight when the run stopped
        let resume = CheckpointState {
            entry_transfer_offset: 8192,
            transfer_window: vec![4096],
        };
        let sink = FileSink::new(&path);
        sink.prepare(data.len() as u64, 4096, Some(&resume)).await.unwrap();
        assert_eq!(sink.received_count(), 1);

        sink.write_at(8192, &data[8192..12_288]).await.unwrap();
        sink.write_at(12_288, &data[12_288..]).await.unwrap();
        assert!(matches!(sink.finalize().await, Err(SourceError::Other(_))));

        sink.write_at(4096, &data[4096..8192]).await.unwrap();
        assert_eq!(sink.received_count(), 4);
        sink.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out.bin"));
        sink.prepare(100, 64, None).await.unwrap();
        assert!(sink.write_at(90, &[0u8; 20]).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let sink = FileSink::new(&path);
        sink.prepare(0, 4096, None).await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_factory_rejects_non_local() {
        let result = FileSinkFactory::new()
            .open(&TransferLocation::Stream { name: "x".into() })
            .await;
        assert!(matches!(result, Err(SourceError::Unsupported(_))));
    }
}
