//! Shared helpers for the ferry integration tests

use ferry_core::{TransferConfig, TransferLocation};

/// Deterministic object contents
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Small-footprint configuration: one pool buffer per block
pub fn test_config(block_size: u64) -> TransferConfig {
    TransferConfig {
        block_size,
        span_size: block_size * 8,
        memory_buffer_size: block_size as usize,
        memory_pool_buffers: 8,
        worker_count: 4,
        max_concurrent_jobs: 4,
        limiter_wake_interval_ms: 5,
        ..TransferConfig::default()
    }
}

/// Local-path location named `name`
pub fn loc(name: &str) -> TransferLocation {
    TransferLocation::local(name)
}
