//! Source and destination locations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Blob flavors, which decide how a blob source is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobType {
    /// Sequential block blob
    BlockBlob,
    /// Sparse page blob with range metadata
    PageBlob,
    /// Append-only blob
    AppendBlob,
}

/// Where an object lives.
///
/// Closed set: the capability traits in [`crate::source`] are implemented per
/// collaborator and dispatch on this enum instead of a location class tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferLocation {
    /// Cloud blob
    Blob {
        /// Blob URI
        uri: String,
        /// Blob flavor
        blob_type: BlobType,
    },
    /// Cloud file share file
    File {
        /// File URI
        uri: String,
    },
    /// Local filesystem path
    LocalPath {
        /// Path on disk
        path: PathBuf,
    },
    /// Caller-supplied stream, identified by name
    Stream {
        /// Stream name used in logs and journals
        name: String,
    },
    /// Plain URI readable with ranged GETs
    Uri {
        /// Absolute URI
        uri: String,
    },
    /// Local directory (enumeration root)
    LocalDirectory {
        /// Directory path
        path: PathBuf,
    },
    /// Blob virtual directory (enumeration root)
    BlobDirectory {
        /// Directory URI
        uri: String,
    },
    /// File share directory (enumeration root)
    FileDirectory {
        /// Directory URI
        uri: String,
    },
}

impl TransferLocation {
    /// Local path location
    pub fn local(path: impl Into<PathBuf>) -> Self {
        TransferLocation::LocalPath { path: path.into() }
    }

    /// Whether this location names a directory rather than one object
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            TransferLocation::LocalDirectory { .. }
                | TransferLocation::BlobDirectory { .. }
                | TransferLocation::FileDirectory { .. }
        )
    }

    /// Whether objects at this location can carry sparse range metadata
    #[must_use]
    pub fn supports_range_discovery(&self) -> bool {
        matches!(
            self,
            TransferLocation::Blob {
                blob_type: BlobType::PageBlob,
                ..
            } | TransferLocation::File { .. }
                | TransferLocation::LocalPath { .. }
        )
    }

    /// Short human-readable name for logs
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            TransferLocation::Blob { uri, .. }
            | TransferLocation::File { uri }
            | TransferLocation::Uri { uri }
            | TransferLocation::BlobDirectory { uri }
            | TransferLocation::FileDirectory { uri } => uri.clone(),
            TransferLocation::LocalPath { path } | TransferLocation::LocalDirectory { path } => {
                path.display().to_string()
            }
            TransferLocation::Stream { name } => format!("stream:{name}"),
        }
    }
}

impl fmt::Display for TransferLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}
