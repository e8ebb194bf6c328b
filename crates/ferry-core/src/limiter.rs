//! Enumeration concurrency limiter
//!
//! Bounds how many object transfers an enumeration keeps outstanding. The
//! enumeration calls [`ConcurrencyLimiter::pause_if_over_limit`] before
//! starting each object; completions wake it through a notify handshake, and a
//! periodic wake re-checks the count so a lost signal only costs one interval.
//!
//! An optional stuck timeout turns a pause that sees no progress at all into
//! [`TransferError::StuckTransfer`]. Progress is any completed object or any
//! [`ConcurrencyLimiter::signal_progress`] call (the writer calls it per chunk).

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Concurrency ceiling with wait/signal handshake.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    ceiling: usize,
    outstanding: AtomicUsize,
    changed: Notify,
    wake_interval: Duration,
    stuck_timeout: Option<Duration>,
    last_progress: Mutex<Instant>,
}

impl ConcurrencyLimiter {
    /// Limiter allowing `ceiling` outstanding transfers
    pub fn new(ceiling: usize, wake_interval: Duration, stuck_timeout: Option<Duration>) -> Self {
        Self {
            ceiling: ceiling.max(1),
            outstanding: AtomicUsize::new(0),
            changed: Notify::new(),
            wake_interval,
            stuck_timeout,
            last_progress: Mutex::new(Instant::now()),
        }
    }

    /// Limiter configured from `config`
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.max_concurrent_jobs,
            config.limiter_wake_interval(),
            config.stuck_timeout(),
        )
    }

    /// Configured ceiling
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Transfers currently outstanding
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Register one outstanding transfer; dropping the permit completes it.
    pub fn start(self: &Arc<Self>) -> LimiterPermit {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        LimiterPermit {
            limiter: Arc::clone(self),
        }
    }

    /// Reset the stuck clock and wake a paused enumeration.
    pub fn signal_progress(&self) {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.changed.notify_waiters();
    }

    fn last_progress(&self) -> Instant {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait while the outstanding count is at or over the ceiling.
    ///
    /// Returns immediately when under the limit. Waiting is not an error.
    ///
    /// # Errors
    ///
    /// - [`TransferError::Cancelled`] once `cancel` fires
    /// - [`TransferError::StuckTransfer`] when the stuck timeout elapses
    ///   without any progress signal
    pub async fn pause_if_over_limit(&self, cancel: &CancellationToken) -> Result<()> {
        let paused_at = Instant::now();
        let mut logged = false;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.outstanding();
            if outstanding < self.ceiling {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if let Some(limit) = self.stuck_timeout {
                let idle = self.last_progress().max(paused_at).elapsed();
                if idle >= limit {
                    tracing::warn!(
                        "No transfer progress for {:?} with {} transfers outstanding",
                        idle,
                        outstanding
                    );
                    return Err(TransferError::StuckTransfer(idle));
                }
            }
            if !logged {
                tracing::trace!(
                    "Enumeration paused: {} outstanding, ceiling {}",
                    outstanding,
                    self.ceiling
                );
                logged = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.wake_interval) => {}
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            }
        }
    }
}

/// One outstanding transfer counted against the limiter.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.limiter.signal_progress();
    }
}
