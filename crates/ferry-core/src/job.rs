//! Transfer jobs and their status machine

use crate::checkpoint::CheckpointState;
use crate::error::{Result, TransferError};
use crate::location::TransferLocation;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Stable job identifier, derived from the source and destination
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId([u8; 16]);

impl JobId {
    /// Identifier of the job copying `source` to `destination`
    pub fn derive(source: &TransferLocation, destination: &TransferLocation) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.display_name().as_bytes());
        hasher.update(&[0]);
        hasher.update(destination.display_name().as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(id)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.short())
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("job id must be 16 bytes"))?;
        Ok(Self(id))
    }
}

/// Status of one object transfer.
///
/// ```text
/// NotStarted ──► Transfer ──► [Monitor ──►] Finished
///     │              │            │
///     ▼              ▼            ▼
///  Skipped        Failed ◄────────┘
///                    │
///                    └──► Transfer (resume)
/// ```
///
/// A missing source found during `Transfer` may also end in `Skipped` when
/// the batch skips missing sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not yet picked up
    NotStarted,
    /// Reading and writing chunks
    Transfer,
    /// All chunks read; waiting for the writer to finish
    Monitor,
    /// Completed successfully
    Finished,
    /// Deliberately not transferred
    Skipped,
    /// Failed; may be resumed
    Failed,
}

impl JobStatus {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (NotStarted, Transfer)
                | (NotStarted, Skipped)
                | (Transfer, Monitor)
                | (Transfer, Finished)
                | (Transfer, Failed)
                | (Transfer, Skipped)
                | (Monitor, Finished)
                | (Monitor, Failed)
                | (Failed, Transfer)
        )
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Skipped)
    }

    /// Whether a batch run still has to process a job in this status
    pub fn needs_run(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::NotStarted => "not started",
            JobStatus::Transfer => "transfer",
            JobStatus::Monitor => "monitor",
            JobStatus::Finished => "finished",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One source → destination object transfer, with its resume state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    /// Job identifier
    pub id: JobId,
    /// Where the object is read from
    pub source: TransferLocation,
    /// Where the object is written to
    pub destination: TransferLocation,
    /// Persisted checkpoint fields
    pub checkpoint: CheckpointState,
    /// Chunk size the checkpoint was recorded with
    pub block_size: u64,
    /// Object length seen by the last attribute fetch
    pub total_length: Option<u64>,
    /// Object ETag seen by the last attribute fetch
    pub etag: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Message of the last failure
    pub last_error: Option<String>,
}

impl TransferJob {
    /// Fresh job with an empty checkpoint
    pub fn new(source: TransferLocation, destination: TransferLocation, block_size: u64) -> Self {
        Self {
            id: JobId::derive(&source, &destination),
            source,
            destination,
            checkpoint: CheckpointState::default(),
            block_size,
            total_length: None,
            etag: None,
            status: JobStatus::NotStarted,
            last_error: None,
        }
    }

    /// Move to `next`, returning the previous status.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] for an illegal transition.
    pub fn transition(&mut self, next: JobStatus) -> Result<JobStatus> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(TransferError::InvalidState(format!(
                "job {} cannot go from {previous} to {next}",
                self.id.short()
            )));
        }
        self.status = next;
        if next == JobStatus::Transfer {
            self.last_error = None;
        }
        Ok(previous)
    }

    /// Whether the recorded checkpoint carries progress
    pub fn is_resuming(&self) -> bool {
        self.checkpoint.has_progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job() -> TransferJob {
        TransferJob::new(
            TransferLocation::LocalPath {
                path: PathBuf::from("/data/a.img"),
            },
            TransferLocation::LocalPath {
                path: PathBuf::from("/backup/a.img"),
            },
            4096,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        job.transition(JobStatus::Transfer).unwrap();
        job.transition(JobStatus::Monitor).unwrap();
        assert_eq!(
            job.transition(JobStatus::Finished).unwrap(),
            JobStatus::Monitor
        );
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_failed_job_resumes() {
        let mut job = job();
        job.transition(JobStatus::Transfer).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        job.last_error = Some("reset".into());
        job.transition(JobStatus::Transfer).unwrap();
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut job = job();
        assert!(job.transition(JobStatus::Finished).is_err());
        job.transition(JobStatus::Skipped).unwrap();
        assert!(job.transition(JobStatus::Transfer).is_err());
        assert!(!JobStatus::Finished.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Monitor.can_transition_to(JobStatus::Transfer));
    }

    #[test]
    fn test_job_id_stable_and_serialized_as_hex() {
        let a = job();
        let b = job();
        assert_eq!(a.id, b.id);
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains(&a.id.to_string()));
        let back: TransferJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert_eq!(a.id.short().len(), 16);
    }
}
