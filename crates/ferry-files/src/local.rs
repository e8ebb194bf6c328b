//! Local filesystem source.
//!
//! Objects are regular files addressed by [`TransferLocation::LocalPath`]. On
//! Linux the source discovers the data extents of sparse files with
//! `SEEK_DATA`/`SEEK_HOLE`, so holes are never read.

use async_trait::async_trait;
use ferry_core::{DataExtent, ObjectAttributes, ObjectSource, SourceError, TransferLocation};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Path of a local location, or `Unsupported` for any other kind
pub(crate) fn local_path(location: &TransferLocation) -> Result<&Path, SourceError> {
    match location {
        TransferLocation::LocalPath { path } => Ok(path),
        _ => Err(SourceError::Unsupported("non-local location")),
    }
}

/// Version tag of a file: its length and modification time.
///
/// A rewrite in place that keeps both is not detected; local files carry
/// nothing stronger without reading them.
fn version_tag(meta: &Metadata) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&meta.len().to_le_bytes());
    if let Ok(Ok(since_epoch)) = meta.modified().map(|t| t.duration_since(UNIX_EPOCH)) {
        hasher.update(&since_epoch.as_nanos().to_le_bytes());
    }
    hex::encode(&hasher.finalize().as_bytes()[..8])
}

/// Reads regular files from the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    discover_ranges: bool,
}

impl LocalFileSource {
    /// Source with sparse range discovery where the platform has it
    pub fn new() -> Self {
        Self {
            discover_ranges: cfg!(target_os = "linux"),
        }
    }

    /// Source that always reads files densely
    pub fn dense() -> Self {
        Self {
            discover_ranges: false,
        }
    }
}

impl Default for LocalFileSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectSource for LocalFileSource {
    async fn fetch_attributes(
        &self,
        location: &TransferLocation,
    ) -> Result<ObjectAttributes, SourceError> {
        let path = local_path(location)?;
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(SourceError::Other(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(ObjectAttributes {
            length: meta.len(),
            etag: Some(version_tag(&meta)),
            kind: "file".into(),
        })
    }

    fn supports_ranges(&self) -> bool {
        self.discover_ranges
    }

    async fn list_ranges(
        &self,
        location: &TransferLocation,
        span_start: u64,
        span_len: u64,
    ) -> Result<Vec<DataExtent>, SourceError> {
        if !self.discover_ranges {
            return Err(SourceError::Unsupported("list_ranges"));
        }
        let path: PathBuf = local_path(location)?.to_path_buf();
        let extents = tokio::task::spawn_blocking(move || {
            sparse::data_extents(&path, span_start, span_len)
        })
        .await
        .map_err(|e| SourceError::Other(format!("range discovery task: {e}")))??;
        tracing::trace!(
            "{}: {} data extents in [{}, +{})",
            location,
            extents.len(),
            span_start,
            span_len
        );
        Ok(extents)
    }

    async fn download_range(
        &self,
        location: &TransferLocation,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), SourceError> {
        let path = local_path(location)?;
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod sparse {
    use ferry_core::DataExtent;
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};
    use std::path::Path;

    /// `lseek` returning `None` past the last data extent (`ENXIO`)
    fn seek(fd: RawFd, offset: u64, whence: libc::c_int) -> io::Result<Option<u64>> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds off_t"))?;
        // SAFETY: `fd` stays open for the duration of the call; lseek does not
        // touch memory.
        let result = unsafe { libc::lseek(fd, offset, whence) };
        if result < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENXIO) => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some(result as u64))
    }

    /// Data extents of `path` within `[start, start + len)`.
    ///
    /// Filesystems without hole reporting yield one extent for the whole span.
    pub(super) fn data_extents(path: &Path, start: u64, len: u64) -> io::Result<Vec<DataExtent>> {
        let file = std::fs::File::open(path)?;
        let fd = file.as_raw_fd();
        let end = start.saturating_add(len);
        let mut extents = Vec::new();
        let mut pos = start;

        while pos < end {
            let data = match seek(fd, pos, libc::SEEK_DATA) {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(err) if err.raw_os_error() == Some(libc::EINVAL) && extents.is_empty() => {
                    return Ok(vec![DataExtent::new(start, end - 1)]);
                }
                Err(err) => return Err(err),
            };
            if data >= end {
                break;
            }
            let hole = seek(fd, data, libc::SEEK_HOLE)?.unwrap_or(end);
            extents.push(DataExtent::new(data, hole.min(end) - 1));
            pos = hole;
        }
        Ok(extents)
    }
}

#[cfg(not(target_os = "linux"))]
mod sparse {
    use ferry_core::DataExtent;
    use std::io;
    use std::path::Path;

    pub(super) fn data_extents(_path: &Path, start: u64, len: u64) -> io::Result<Vec<DataExtent>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![DataExtent::new(start, start + len - 1)])
    }
}
