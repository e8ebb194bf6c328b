//! Transfer configuration

use crate::error::{Result, TransferError};
use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_WINDOW_SIZE, DEFAULT_MERGE_GAP_THRESHOLD, DEFAULT_SPAN_SIZE,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fault injection knobs handed to a transfer at construction.
///
/// Never process-wide: every transfer carries its own copy, so concurrent
/// tests cannot leak faults into each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestHooks {
    /// Fail each reader with a transient error once it has published this many chunks
    pub fail_after_published_chunks: Option<u64>,
}

/// Tunables for the transfer core.
///
/// Loaded from the `[transfer]` table of the CLI config file; every field has a
/// default so partial tables are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes; the unit of the transfer window
    pub block_size: u64,
    /// Maximum number of claimed-but-unconfirmed chunks per object
    pub max_window_size: usize,
    /// Size of one range-listing span (rounded down to whole blocks)
    pub span_size: u64,
    /// Gaps between data ranges smaller than this are transferred as data
    pub merge_gap_threshold: u64,
    /// Size of one memory pool buffer
    pub memory_buffer_size: usize,
    /// Ceiling on outstanding memory pool buffers
    pub memory_pool_buffers: usize,
    /// Worker slots in the scheduler (0 = derive from available parallelism)
    pub worker_count: usize,
    /// Ceiling on concurrently running object transfers in a batch
    pub max_concurrent_jobs: usize,
    /// How often a paused enumeration re-checks the limiter, in milliseconds
    pub limiter_wake_interval_ms: u64,
    /// Fail a paused enumeration after this many seconds without any progress
    pub stuck_timeout_secs: Option<u64>,
    /// Record missing sources as skipped instead of failed
    pub skip_missing_sources: bool,
    /// Cancel the whole batch on the first failed object
    pub fail_fast: bool,
    /// Fault injection, never read from config files
    #[serde(skip)]
    pub test_hooks: TestHooks,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
            span_size: DEFAULT_SPAN_SIZE,
            merge_gap_threshold: DEFAULT_MERGE_GAP_THRESHOLD,
            memory_buffer_size: DEFAULT_BLOCK_SIZE as usize,
            memory_pool_buffers: 64,
            worker_count: 0,
            max_concurrent_jobs: 16,
            limiter_wake_interval_ms: 100,
            stuck_timeout_secs: None,
            skip_missing_sources: false,
            fail_fast: false,
            test_hooks: TestHooks::default(),
        }
    }
}

impl TransferConfig {
    /// Check the configuration for values the core cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > u64::from(u32::MAX) {
            return Err(TransferError::InvalidConfig(format!(
                "block_size must be in 1..={}, got {}",
                u32::MAX,
                self.block_size
            )));
        }
        if self.max_window_size == 0 {
            return Err(TransferError::InvalidConfig(
                "max_window_size must be > 0".into(),
            ));
        }
        if self.span_size < self.block_size {
            return Err(TransferError::InvalidConfig(format!(
                "span_size ({}) must be at least block_size ({})",
                self.span_size, self.block_size
            )));
        }
        if self.memory_buffer_size == 0 {
            return Err(TransferError::InvalidConfig(
                "memory_buffer_size must be > 0".into(),
            ));
        }
        if self.memory_pool_buffers < self.buffers_per_block() {
            return Err(TransferError::InvalidConfig(format!(
                "memory_pool_buffers ({}) cannot hold one block ({} buffers)",
                self.memory_pool_buffers,
                self.buffers_per_block()
            )));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(TransferError::InvalidConfig(
                "max_concurrent_jobs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Span size rounded down to a whole number of blocks
    #[must_use]
    pub fn effective_span_size(&self) -> u64 {
        (self.span_size / self.block_size).max(1) * self.block_size
    }

    /// Number of pool buffers one full block occupies
    #[must_use]
    pub fn buffers_per_block(&self) -> usize {
        (self.block_size as usize).div_ceil(self.memory_buffer_size.max(1))
    }

    /// Scheduler worker slots after resolving the automatic setting
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(8)
    }

    /// Limiter re-check period
    #[must_use]
    pub fn limiter_wake_interval(&self) -> Duration {
        Duration::from_millis(self.limiter_wake_interval_ms.max(1))
    }

    /// Stuck-transfer timeout, if enabled
    #[must_use]
    pub fn stuck_timeout(&self) -> Option<Duration> {
        self.stuck_timeout_secs.map(Duration::from_secs)
    }

    /// Same configuration with a different block size
    #[must_use]
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }
}
