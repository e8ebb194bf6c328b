//! In-memory objects.
//!
//! [`MemorySource`] holds dense or sparse objects keyed by location display
//! name and can be told to misbehave through a [`FaultPlan`]. [`MemorySinks`]
//! keeps every destination in memory and outlives the transfers that write
//! to it, so a resumed run sees what an earlier run wrote.

use async_trait::async_trait;
use dashmap::DashMap;
use ferry_core::{
    CheckpointState, ChunkSink, DataExtent, ObjectAttributes, ObjectSource, SinkFactory, SourceError,
    TransferLocation,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Faults a [`MemorySource`] injects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail downloads whose range contains this offset
    pub fail_download_at: Option<u64>,
    /// How many such downloads fail before the fault clears (0 = forever)
    pub fail_times: u32,
    /// Report this ETag instead of the stored one
    pub etag_override: Option<String>,
    /// Sleep before every download
    pub download_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    /// `None` for dense objects
    extents: Option<Vec<DataExtent>>,
    etag: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source serving objects from memory
#[derive(Debug, Default)]
pub struct MemorySource {
    objects: DashMap<String, MemoryObject>,
    faults: Mutex<FaultPlan>,
    failures: AtomicU64,
    downloaded: AtomicU64,
}

impl MemorySource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a dense object at `name`
    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        let name = name.into();
        let etag = Self::etag_of(&data);
        self.objects.insert(
            name,
            MemoryObject {
                data,
                extents: None,
                etag,
            },
        );
    }

    /// Store a sparse object of `length` bytes.
    ///
    /// Bytes inside `extents` (inclusive ends) follow `fill(offset)`; all
    /// other bytes are zero.
    pub fn insert_sparse(
        &self,
        name: impl Into<String>,
        length: u64,
        extents: Vec<DataExtent>,
        fill: impl Fn(u64) -> u8,
    ) {
        let mut data = vec![0u8; length as usize];
        for extent in extents.iter().filter(|e| e.start < length) {
            let end = extent.end.min(length - 1);
            for offset in extent.start..=end {
                data[offset as usize] = fill(offset);
            }
        }
        let etag = Self::etag_of(&data);
        self.objects.insert(
            name.into(),
            MemoryObject {
                data,
                extents: Some(extents),
                etag,
            },
        );
    }

    /// Drop the object at `name`
    pub fn remove(&self, name: &str) {
        self.objects.remove(name);
    }

    /// Replace the fault plan
    pub fn set_faults(&self, plan: FaultPlan) {
        *lock(&self.faults) = plan;
        self.failures.store(0, Ordering::Release);
    }

    /// Bytes served by `download_range` so far
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Contents of the object at `name`
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.get(name).map(|o| o.data.clone())
    }

    fn etag_of(data: &[u8]) -> String {
        hex::encode(&blake3::hash(data).as_bytes()[..8])
    }

    fn object(&self, location: &TransferLocation) -> Result<MemoryObject, SourceError> {
        self.objects
            .get(&location.display_name())
            .map(|o| o.clone())
            .ok_or(SourceError::NotFound)
    }

    fn injected_failure(&self, offset: u64, len: u64) -> Option<SourceError> {
        let plan = lock(&self.faults).clone();
        let at = plan.fail_download_at?;
        if at < offset || at >= offset + len {
            return None;
        }
        let failed = self.failures.fetch_add(1, Ordering::AcqRel);
        if plan.fail_times != 0 && failed >= u64::from(plan.fail_times) {
            return None;
        }
        tracing::trace!("Injected download failure at {}", at);
        Some(SourceError::Other(format!("injected failure at offset {at}")))
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn fetch_attributes(
        &self,
        location: &TransferLocation,
    ) -> Result<ObjectAttributes, SourceError> {
        let object = self.object(location)?;
        let etag = lock(&self.faults)
            .etag_override
            .clone()
            .unwrap_or(object.etag);
        Ok(ObjectAttributes {
            length: object.data.len() as u64,
            etag: Some(etag),
            kind: if object.extents.is_some() {
                "memory-sparse".into()
            } else {
                "memory".into()
            },
        })
    }

    fn supports_ranges(&self) -> bool {
        true
    }

    async fn list_ranges(
        &self,
        location: &TransferLocation,
        span_start: u64,
        span_len: u64,
    ) -> Result<Vec<DataExtent>, SourceError> {
        let object = self.object(location)?;
        let length = object.data.len() as u64;
        let span_end = span_start.saturating_add(span_len).min(length);
        if span_start >= span_end {
            return Ok(Vec::new());
        }
        let Some(extents) = object.extents else {
            return Ok(vec![DataExtent::new(span_start, span_end - 1)]);
        };
        // Unclipped on purpose: callers clip and order what they receive.
        Ok(extents
            .into_iter()
            .filter(|e| e.start < span_end && e.end >= span_start)
            .collect())
    }

    async fn download_range(
        &self,
        location: &TransferLocation,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), SourceError> {
        let delay = lock(&self.faults).download_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.injected_failure(offset, buf.len() as u64) {
            return Err(err);
        }
        let object = self
            .objects
            .get(&location.display_name())
            .ok_or(SourceError::NotFound)?;
        let start = offset as usize;
        let end = start + buf.len();
        let Some(bytes) = object.data.get(start..end) else {
            return Err(SourceError::Other(format!(
                "read [{start}, {end}) past end of {} bytes",
                object.data.len()
            )));
        };
        buf.copy_from_slice(bytes);
        self.downloaded
            .fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }
}

/// One destination kept in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
    finalized: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemorySink {
    /// Copy of the written bytes
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    /// Whether `finalize` has run
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Make every later `write_at` fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn prepare(
        &self,
        total_length: u64,
        _block_size: u64,
        resume: Option<&CheckpointState>,
    ) -> Result<(), SourceError> {
        let mut data = lock(&self.data);
        if resume.is_none() {
            data.clear();
        }
        data.resize(total_length as usize, 0);
        self.finalized.store(false, Ordering::Release);
        Ok(())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), SourceError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(SourceError::Other("injected write failure".into()));
        }
        let mut data = lock(&self.data);
        let start = offset as usize;
        let end = start + bytes.len();
        let len = data.len();
        let Some(target) = data.get_mut(start..end) else {
            return Err(SourceError::Other(format!(
                "write [{start}, {end}) past end of {len} bytes"
            )));
        };
        target.copy_from_slice(bytes);
        Ok(())
    }

    async fn finalize(&self) -> Result<(), SourceError> {
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}

/// Destinations kept in memory, keyed by display name
#[derive(Debug, Default, Clone)]
pub struct MemorySinks {
    sinks: Arc<DashMap<String, Arc<MemorySink>>>,
}

impl MemorySinks {
    /// Empty set of destinations
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink for `name`, if one was opened
    pub fn get(&self, name: &str) -> Option<Arc<MemorySink>> {
        self.sinks.get(name).map(|s| Arc::clone(&s))
    }

    /// Sink for `name`, created if missing
    pub fn sink(&self, name: &str) -> Arc<MemorySink> {
        Arc::clone(&self.sinks.entry(name.to_string()).or_default())
    }
}

#[async_trait]
impl SinkFactory for MemorySinks {
    async fn open(&self, location: &TransferLocation) -> Result<Arc<dyn ChunkSink>, SourceError> {
        Ok(self.sink(&location.display_name()))
    }
}
