//! Bounded memory pool for chunk buffers
//!
//! Every chunk read into memory lives in buffers drawn from this pool. The
//! number of outstanding buffers never exceeds the configured ceiling, so peak
//! memory is fixed regardless of how many chunks are in flight.
//!
//! # Design
//!
//! - **Never blocks:** [`MemoryPool::try_acquire`] returns `None` when the
//!   ceiling would be exceeded. That is backpressure; the caller re-signals
//!   its own work flag and is dispatched again once buffers come back.
//! - **All-or-nothing:** a request for `n` buffers either gets all `n` or none,
//!   so two readers can never deadlock holding half a chunk each.
//! - **Lock-free:** the free list is a `crossbeam_queue::ArrayQueue` and the
//!   outstanding count is a CAS-guarded atomic.
//! - **Lazy:** buffers are allocated on first use and recycled afterwards.
//! - **RAII:** a [`PoolBuffer`] returns itself to the pool on drop, so error
//!   paths cannot leak pool capacity.
//!
//! # Example
//!
//! ```
//! use ferry_core::memory_pool::MemoryPool;
//!
//! let pool = MemoryPool::new(1024, 2);
//! let buffers = pool.try_acquire(2).unwrap();
//! assert!(pool.try_acquire(1).is_none());
//!
//! pool.release(buffers);
//! assert!(pool.try_acquire(1).is_some());
//! ```

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

struct PoolInner {
    /// Recycled buffers ready for reuse
    free: ArrayQueue<Vec<u8>>,
    /// Fixed size of every buffer
    buffer_size: usize,
    /// Maximum buffers outstanding at once
    ceiling: usize,
    /// Buffers currently handed out
    outstanding: AtomicUsize,
    /// Woken whenever buffers return
    released: Notify,
}

/// A bounded, lock-free pool of fixed-size buffers
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Create a pool of `ceiling` buffers of `buffer_size` bytes each.
    ///
    /// No memory is allocated until buffers are first acquired.
    pub fn new(buffer_size: usize, ceiling: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(ceiling.max(1)),
                buffer_size,
                ceiling,
                outstanding: AtomicUsize::new(0),
                released: Notify::new(),
            }),
        }
    }

    /// Try to take `n` buffers at once.
    ///
    /// Returns `None` when fewer than `n` buffers are available. Repeated calls
    /// on an exhausted pool keep returning `None`; they never fail otherwise.
    pub fn try_acquire(&self, n: usize) -> Option<Vec<PoolBuffer>> {
        let inner = &self.inner;
        let mut current = inner.outstanding.load(Ordering::Acquire);
        loop {
            let wanted = current.checked_add(n)?;
            if wanted > inner.ceiling {
                return None;
            }
            match inner.outstanding.compare_exchange_weak(
                current,
                wanted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let buffers = (0..n)
            .map(|_| PoolBuffer {
                data: inner
                    .free
                    .pop()
                    .unwrap_or_else(|| vec![0u8; inner.buffer_size]),
                pool: Arc::clone(inner),
            })
            .collect();
        Some(buffers)
    }

    /// Return buffers to the pool.
    ///
    /// Dropping a [`PoolBuffer`] has the same effect; this is the explicit form.
    pub fn release(&self, buffers: Vec<PoolBuffer>) {
        drop(buffers);
    }

    /// Whether `n` buffers could be acquired right now
    #[must_use]
    pub fn can_acquire(&self, n: usize) -> bool {
        self.available() >= n
    }

    /// Buffers that can still be handed out
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner
            .ceiling
            .saturating_sub(self.inner.outstanding.load(Ordering::Acquire))
    }

    /// Buffers currently handed out
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Size in bytes of every buffer
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Ceiling on outstanding buffers
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.ceiling
    }

    /// Buffers needed to hold `len` bytes
    #[must_use]
    pub fn buffers_for(&self, len: u64) -> usize {
        (len as usize).div_ceil(self.inner.buffer_size.max(1))
    }

    /// Wait until some buffer is returned.
    ///
    /// A release that happens while nobody waits is remembered, so a
    /// subsequent call returns immediately.
    pub async fn released(&self) {
        self.inner.released.notified().await;
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("buffer_size", &self.buffer_size())
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`MemoryPool`]
///
/// Dereferences to a byte slice of the pool's buffer size. Returned to the
/// pool when dropped.
pub struct PoolBuffer {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PoolBuffer {
    /// Buffer length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer has zero length
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        // Free list is sized to the ceiling, a failed push just drops the buffer
        let _ = self.pool.free.push(data);
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.pool.released.notify_one();
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer").field("len", &self.len()).finish()
    }
}
