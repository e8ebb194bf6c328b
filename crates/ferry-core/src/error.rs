//! Error types for the transfer core

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a collaborator (object store client, filesystem, ...).
///
/// The not-found condition is kept separate so the core can translate it into
/// [`TransferError::SourceDoesNotExist`] instead of a generic failure.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The addressed object does not exist
    #[error("object not found")]
    NotFound,

    /// The operation is not supported by this collaborator
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Any other failure (network, storage, permissions)
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound,
            _ => SourceError::Other(err.to_string()),
        }
    }
}

/// Errors that can occur while transferring an object
#[derive(Debug, Error)]
pub enum TransferError {
    /// Persisted resume state no longer matches reality or is internally inconsistent
    #[error("Restartable info corrupted: {0}")]
    RestartableInfoCorrupted(String),

    /// The source object does not exist
    #[error("Source does not exist: {0}")]
    SourceDoesNotExist(String),

    /// Source-side collaborator call failed
    #[error("Source error: {0}")]
    Source(String),

    /// Destination-side collaborator call failed
    #[error("Sink error: {0}")]
    Sink(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No progress signal was observed within the configured timeout
    #[error("Transfer stuck: no progress for {0:?}")]
    StuckTransfer(Duration),

    /// Cooperative cancellation was observed
    #[error("Transfer cancelled")]
    Cancelled,

    /// Invalid state transition or broken internal invariant
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The location kind cannot be used for this operation
    #[error("Unsupported location: {0}")]
    UnsupportedLocation(String),

    /// Journal was written by an incompatible format version
    #[error("Journal format version mismatch: expected {expected}, found {found}")]
    JournalVersionMismatch {
        /// Version this build understands
        expected: u32,
        /// Version found in the journal
        found: u32,
    },

    /// Journal encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransferError {
    /// Translate a source collaborator error, keeping not-found distinguishable.
    pub fn from_source(err: SourceError, location: &str) -> Self {
        match err {
            SourceError::NotFound => TransferError::SourceDoesNotExist(location.to_string()),
            other => TransferError::Source(format!("{location}: {other}")),
        }
    }

    /// Whether an outer retry policy may try this job again.
    ///
    /// Only plain collaborator and I/O failures qualify; corrupted resume state,
    /// missing sources and liveness failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Source(_) | TransferError::Sink(_) | TransferError::Io(_)
        )
    }

    /// Whether the error must abort the job without any retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::RestartableInfoCorrupted(_)
                | TransferError::StuckTransfer(_)
                | TransferError::JournalVersionMismatch { .. }
        )
    }

    /// Whether the error reports a missing source object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferError::SourceDoesNotExist(_))
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguishable() {
        let err = TransferError::from_source(SourceError::NotFound, "blob://c/a");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("blob://c/a"));
    }

    #[test]
    fn test_other_source_error_is_retryable() {
        let err = TransferError::from_source(SourceError::Other("reset".into()), "x");
        assert!(matches!(err, TransferError::Source(_)));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err = TransferError::RestartableInfoCorrupted("window".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_not_found_maps_to_source_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(SourceError::from(io), SourceError::NotFound));
    }
}
