//! Versioned transfer journal
//!
//! One explicit JSON schema holding every job's persisted fields. A journal
//! written by a different format version is rejected outright; there is no
//! upcasting.

use crate::JOURNAL_FORMAT_VERSION;
use crate::error::{Result, TransferError};
use crate::job::TransferJob;
use crate::progress::ProgressSnapshot;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Serialized state of a whole transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJournal {
    /// Schema version; must equal [`JOURNAL_FORMAT_VERSION`] to load
    pub format_version: u32,
    /// Every job with its checkpoint
    pub jobs: Vec<TransferJob>,
    /// Counters at snapshot time, informational only
    pub progress: ProgressSnapshot,
}

#[derive(Deserialize)]
struct VersionHeader {
    format_version: u32,
}

impl TransferJournal {
    /// Journal at the current format version
    pub fn new(jobs: Vec<TransferJob>, progress: ProgressSnapshot) -> Self {
        Self {
            format_version: JOURNAL_FORMAT_VERSION,
            jobs,
            progress,
        }
    }

    /// Encode as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode, rejecting any other format version.
    ///
    /// # Errors
    ///
    /// [`TransferError::JournalVersionMismatch`] if the version differs, or
    /// [`TransferError::Serialization`] for malformed input.
    pub fn from_json(text: &str) -> Result<Self> {
        let header: VersionHeader = serde_json::from_str(text)?;
        if header.format_version != JOURNAL_FORMAT_VERSION {
            return Err(TransferError::JournalVersionMismatch {
                expected: JOURNAL_FORMAT_VERSION,
                found: header.format_version,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Write atomically: a uniquely named temporary file next to `path`,
    /// synced and then renamed over it. Concurrent saves never share a
    /// temporary file; the last rename wins.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_json()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(text.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| TransferError::InvalidState(format!("journal save task failed: {e}")))??;
        tracing::debug!(
            "Saved journal {} ({} jobs)",
            path.display(),
            self.jobs.len()
        );
        Ok(())
    }

    /// Read and decode a journal file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointState;
    use crate::job::JobStatus;
    use crate::location::TransferLocation;

    fn journal() -> TransferJournal {
        let mut job = TransferJob::new(
            TransferLocation::local("/src/disk.img"),
            TransferLocation::local("/dst/disk.img"),
            4096,
        );
        job.checkpoint = CheckpointState {
            entry_transfer_offset: 12_288,
            transfer_window: vec![4096],
        };
        job.total_length = Some(20_000);
        job.etag = Some("abc".into());
        job.status = JobStatus::Failed;
        TransferJournal::new(vec![job], ProgressSnapshot::default())
    }

    #[test]
    fn test_json_round_trip() {
        let original = journal();
        let decoded = TransferJournal::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut old = journal();
        old.format_version = JOURNAL_FORMAT_VERSION + 1;
        let text = serde_json::to_string(&old).unwrap();
        let err = TransferJournal::from_json(&text).unwrap_err();
        assert!(matches!(
            err,
            TransferError::JournalVersionMismatch { found, .. } if found == JOURNAL_FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            TransferJournal::from_json("{ not json"),
            Err(TransferError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.journal");
        let original = journal();
        original.save(&path).await.unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(TransferJournal::load(&path).await.unwrap(), original);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.journal");

        let mut saves = Vec::new();
        for i in 0..8u64 {
            let path = path.clone();
            saves.push(tokio::spawn(async move {
                let mut journal = journal();
                journal.progress.bytes_transferred = i;
                journal.save(&path).await
            }));
        }
        for save in saves {
            save.await.unwrap().unwrap();
        }

        // One complete journal from whichever save renamed last, no leftovers
        let loaded = TransferJournal::load(&path).await.unwrap();
        assert!(loaded.progress.bytes_transferred < 8);
        assert_eq!(loaded.jobs, journal().jobs);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
