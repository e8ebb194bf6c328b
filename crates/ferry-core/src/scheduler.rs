//! Work scheduler for transfer state machines
//!
//! Every reader and writer is a cooperative actor: the scheduler polls its
//! has-work flag and, when the flag was raised, dispatches exactly one unit of
//! work onto a bounded set of worker slots. The flag is cleared as part of the
//! poll ([`StateMachine::take_work`]), so there is at most one dispatch per
//! raise. A unit that finds more to do raises the flag again; a reader does so
//! before its own I/O so the ranges of one chunk can download side by side.
//!
//! The scheduler sleeps until one of these happens:
//!
//! - a machine raises its flag (shared wake notify)
//! - a pool buffer is released (memory backpressure lifted)
//! - a new machine is submitted
//! - the poll interval elapses (fallback against lost wakeups)

use crate::memory_pool::MemoryPool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

/// A state machine driven by the scheduler.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Clear and return the has-work flag.
    ///
    /// May return `false` with the flag still raised when the next unit could
    /// not make progress anyway (for instance the pool is exhausted); the
    /// scheduler asks again after the next wakeup.
    fn take_work(&self) -> bool;

    /// Run one unit of work.
    async fn do_work(self: Arc<Self>);

    /// Whether the machine reached a terminal state and can be dropped
    fn is_done(&self) -> bool;

    /// Label for logs
    fn label(&self) -> String;
}

/// Handle for submitting machines to a running scheduler.
///
/// Dropping every handle lets the scheduler exit once its machines are done.
#[derive(Clone)]
pub struct SchedulerHandle {
    intake: mpsc::UnboundedSender<Arc<dyn StateMachine>>,
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    /// Hand a machine to the scheduler.
    ///
    /// Returns `false` if the scheduler has already shut down.
    pub fn submit(&self, machine: Arc<dyn StateMachine>) -> bool {
        self.intake.send(machine).is_ok()
    }

    /// Wake notify shared by every machine's work signal
    pub fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle").finish_non_exhaustive()
    }
}

/// Worker-slot scheduler
pub struct Scheduler {
    workers: usize,
    poll_interval: Duration,
    pool: MemoryPool,
}

impl Scheduler {
    /// Scheduler with `workers` concurrent units of work
    pub fn new(workers: usize, pool: MemoryPool) -> Self {
        Self {
            workers: workers.max(1),
            poll_interval: Duration::from_millis(250),
            pool,
        }
    }

    /// Set the fallback poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the dispatch loop.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (intake, rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let handle = SchedulerHandle {
            intake,
            wake: Arc::clone(&wake),
        };
        let task = tokio::spawn(self.run(rx, wake));
        (handle, task)
    }

    async fn run(
        self,
        mut intake: mpsc::UnboundedReceiver<Arc<dyn StateMachine>>,
        wake: Arc<Notify>,
    ) {
        let slots = Arc::new(Semaphore::new(self.workers));
        let mut machines: Vec<Arc<dyn StateMachine>> = Vec::new();
        let mut intake_open = true;

        tracing::debug!("Scheduler started with {} worker slots", self.workers);

        loop {
            while let Ok(machine) = intake.try_recv() {
                tracing::trace!("Scheduling {}", machine.label());
                machines.push(machine);
            }
            machines.retain(|m| {
                let done = m.is_done();
                if done {
                    tracing::trace!("Retiring {}", m.label());
                }
                !done
            });

            if !intake_open && machines.is_empty() {
                break;
            }

            let mut dispatched = false;
            for machine in &machines {
                if !machine.take_work() {
                    continue;
                }
                let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                    return;
                };
                let machine = Arc::clone(machine);
                let wake = Arc::clone(&wake);
                tokio::spawn(async move {
                    machine.do_work().await;
                    drop(permit);
                    wake.notify_one();
                });
                dispatched = true;
            }
            if dispatched {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = wake.notified() => {}
                _ = self.pool.released() => {}
                received = intake.recv(), if intake_open => match received {
                    Some(machine) => machines.push(machine),
                    None => intake_open = false,
                },
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        // Work units of retired machines may still be finishing I/O.
        let _drained = slots.acquire_many(self.workers as u32).await;
        tracing::debug!("Scheduler stopped");
    }
}
