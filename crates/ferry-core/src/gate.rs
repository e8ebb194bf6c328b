//! Completion gates and work signals
//!
//! A [`CountdownGate`] makes "the last one to finish starts the next phase"
//! explicit: [`CountdownGate::signal`] returns `true` for exactly one caller.
//! A [`WorkSignal`] is the has-work flag a state machine raises for the
//! scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Countdown paired with a notify primitive.
#[derive(Debug)]
pub struct CountdownGate {
    remaining: AtomicUsize,
    done: Notify,
}

impl CountdownGate {
    /// Gate that opens after `count` signals; a zero count starts open.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            done: Notify::new(),
        }
    }

    /// Record one completion.
    ///
    /// Returns `true` for the caller that brings the count to zero, and only
    /// for that caller. Signals past zero are ignored.
    pub fn signal(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.done.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// Completions still outstanding
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Whether the gate has opened
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until the gate opens.
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

/// Has-work flag of one state machine.
///
/// Raising the flag also wakes the scheduler through the shared notify.
#[derive(Debug, Clone)]
pub struct WorkSignal {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WorkSignal {
    /// Flag starting raised, waking `wake` on every raise
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
            wake,
        }
    }

    /// Signal detached from any scheduler, for tests
    pub fn detached() -> Self {
        Self::new(Arc::new(Notify::new()))
    }

    /// Raise the flag and wake the scheduler
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Clear the flag, returning whether it was raised.
    ///
    /// At most one caller observes `true` per raise, which is what keeps a
    /// machine to one dispatch in flight.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Whether the flag is raised, without clearing it
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
