//! End-to-end transfers through the batch orchestrator

use async_trait::async_trait;
use ferry_core::{
    CheckpointState, ChunkSink, DataExtent, JobStatus, SinkFactory, SourceError, Transfer,
    TransferConfig, TransferLocation,
};
use ferry_files::memory::MemorySink;
use ferry_files::{FileSinkFactory, LocalFileSource, MemorySinks, MemorySource};
use ferry_integration_tests::{loc, pattern, test_config};
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;

/// Sink recording every write it receives
#[derive(Default)]
struct RecordingSink {
    inner: MemorySink,
    writes: Mutex<Vec<(u64, usize)>>,
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn prepare(
        &self,
        total: u64,
        block: u64,
        resume: Option<&CheckpointState>,
    ) -> Result<(), SourceError> {
        self.inner.prepare(total, block, resume).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SourceError> {
        self.writes.lock().unwrap().push((offset, data.len()));
        self.inner.write_at(offset, data).await
    }

    async fn finalize(&self) -> Result<(), SourceError> {
        self.inner.finalize().await
    }
}

struct RecordingFactory(Arc<RecordingSink>);

#[async_trait]
impl SinkFactory for RecordingFactory {
    async fn open(&self, _location: &TransferLocation) -> Result<Arc<dyn ChunkSink>, SourceError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_ten_mib_object_in_three_chunks() {
    let data = pattern((10 * MIB) as usize);
    let source = Arc::new(MemorySource::new());
    source.insert("/src/big", data.clone());
    let sink = Arc::new(RecordingSink::default());

    let config = TransferConfig {
        memory_pool_buffers: 4,
        ..test_config(4 * MIB)
    };
    let transfer = Transfer::new(
        config,
        source.clone(),
        Arc::new(RecordingFactory(sink.clone())),
    )
    .unwrap();
    let id = transfer.add_job(loc("/src/big"), loc("/dst/big")).unwrap();
    let summary = transfer.run().await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(transfer.job_status(id), Some(JobStatus::Finished));
    assert_eq!(summary.progress.bytes_transferred, 10 * MIB);
    assert_eq!(source.downloaded_bytes(), 10 * MIB);

    let mut writes = sink.writes.lock().unwrap().clone();
    writes.sort();
    assert_eq!(
        writes,
        vec![
            (0, (4 * MIB) as usize),
            (4 * MIB, (4 * MIB) as usize),
            (8 * MIB, (2 * MIB) as usize),
        ]
    );
    assert_eq!(sink.inner.contents(), data);
    assert!(sink.inner.is_finalized());

    let journal = transfer.snapshot();
    assert_eq!(journal.jobs[0].checkpoint.entry_transfer_offset, 10 * MIB);
    assert!(journal.jobs[0].checkpoint.transfer_window.is_empty());
}

#[tokio::test]
async fn test_sparse_object_reads_only_data() {
    let source = Arc::new(MemorySource::new());
    let length = 64 * 4096;
    source.insert_sparse(
        "/src/sparse",
        length,
        vec![
            DataExtent::new(4096 * 3, 4096 * 3 + 99),
            DataExtent::new(4096 * 40, 4096 * 42 - 1),
        ],
        |i| (i % 7 + 1) as u8,
    );
    let sinks = MemorySinks::new();
    let transfer = Transfer::new(test_config(4096), source.clone(), Arc::new(sinks.clone())).unwrap();
    transfer.add_job(loc("/src/sparse"), loc("/dst/sparse")).unwrap();
    let summary = transfer.run().await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(summary.progress.bytes_transferred, length);
    assert!(source.downloaded_bytes() < length / 4);
    assert_eq!(
        sinks.get("/dst/sparse").unwrap().contents(),
        source.contents("/src/sparse").unwrap()
    );
}

#[tokio::test]
async fn test_batch_with_mixed_outcomes() {
    let source = Arc::new(MemorySource::new());
    source.insert("/src/a", pattern(50_000));
    source.insert("/src/b", Vec::new());
    source.insert("/src/c", pattern(4096 * 5));
    let sinks = MemorySinks::new();
    let config = TransferConfig {
        skip_missing_sources: true,
        max_concurrent_jobs: 2,
        ..test_config(4096)
    };
    let transfer = Transfer::new(config, source.clone(), Arc::new(sinks.clone())).unwrap();
    for name in ["a", "b", "c", "missing"] {
        transfer
            .add_job(loc(&format!("/src/{name}")), loc(&format!("/dst/{name}")))
            .unwrap();
    }
    let summary = transfer.run().await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(summary.progress.files_total, 4);
    assert_eq!(summary.progress.files_transferred, 3);
    assert_eq!(summary.progress.files_skipped, 1);
    assert_eq!(summary.progress.bytes_transferred, 50_000 + 4096 * 5);
    assert!(sinks.get("/dst/b").unwrap().is_finalized());
    assert!(sinks.get("/dst/missing").is_none_or(|s| !s.is_finalized()));
}

#[tokio::test]
async fn test_fail_fast_cancels_batch() {
    let source = Arc::new(MemorySource::new());
    for i in 0..6 {
        source.insert(format!("/src/{i}"), pattern(4096 * 4));
    }
    source.remove("/src/0");
    let config = TransferConfig {
        fail_fast: true,
        max_concurrent_jobs: 1,
        ..test_config(4096)
    };
    let transfer = Transfer::new(config, source, Arc::new(MemorySinks::new())).unwrap();
    for i in 0..6 {
        transfer
            .add_job(loc(&format!("/src/{i}")), loc(&format!("/dst/{i}")))
            .unwrap();
    }
    let summary = transfer.run().await.unwrap();

    assert!(summary.cancelled);
    assert!(!summary.is_success());
    assert_eq!(summary.failures[0].source, "/src/0");
    assert!(summary.progress.files_transferred < 5);
}

#[tokio::test]
async fn test_second_run_skips_finished_jobs() {
    let source = Arc::new(MemorySource::new());
    source.insert("/src/a", pattern(10_000));
    let transfer = Transfer::new(test_config(4096), source.clone(), Arc::new(MemorySinks::new())).unwrap();
    transfer.add_job(loc("/src/a"), loc("/dst/a")).unwrap();
    transfer.run().await.unwrap();
    let before = source.downloaded_bytes();

    let summary = transfer.run().await.unwrap();
    assert!(summary.is_success());
    assert_eq!(source.downloaded_bytes(), before);
    assert_eq!(summary.progress.files_transferred, 1);
}

#[tokio::test]
async fn test_local_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("copy/dst.img");

    let data = pattern(300_000);
    std::fs::write(&src, &data).unwrap();

    let transfer = Transfer::new(
        test_config(64 * 1024),
        Arc::new(LocalFileSource::new()),
        Arc::new(FileSinkFactory::new()),
    )
    .unwrap();
    transfer
        .add_job(TransferLocation::local(&src), TransferLocation::local(&dst))
        .unwrap();
    let summary = transfer.run().await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_local_sparse_file_end_to_end() {
    use std::io::{Seek, SeekFrom, Write};

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("sparse.img");
    let dst = dir.path().join("sparse.copy");
    {
        let mut file = std::fs::File::create(&src).unwrap();
        file.set_len(8 * MIB).unwrap();
        file.seek(SeekFrom::Start(3 * MIB + 123)).unwrap();
        file.write_all(&pattern(10_000)).unwrap();
    }

    let transfer = Transfer::new(
        test_config(256 * 1024),
        Arc::new(LocalFileSource::new()),
        Arc::new(FileSinkFactory::new()),
    )
    .unwrap();
    transfer
        .add_job(TransferLocation::local(&src), TransferLocation::local(&dst))
        .unwrap();
    let summary = transfer.run().await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(std::fs::read(&dst).unwrap(), std::fs::read(&src).unwrap());
}
