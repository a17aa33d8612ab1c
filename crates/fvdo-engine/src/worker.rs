//! Worker-pool thread marking.
//!
//! Blocking admission is forbidden on an instance's own worker threads;
//! the admission path detects them through a thread-local mark. The mark
//! is a contract: every thread a work queue spawns for an instance must
//! hold a [`WorkerGuard`] for that instance for the thread's whole
//! service loop.

use fvdo_types::InstanceId;
use std::cell::Cell;

thread_local! {
    static WORKER_OWNER: Cell<Option<InstanceId>> = const { Cell::new(None) };
}

/// Marks the current thread as a worker of `instance` until dropped.
#[derive(Debug)]
pub struct WorkerGuard {
    previous: Option<InstanceId>,
}

impl WorkerGuard {
    /// Mark the current thread. Nesting is allowed; the innermost mark
    /// wins and the previous one is restored on drop.
    #[must_use]
    pub fn enter(instance: InstanceId) -> Self {
        let previous = WORKER_OWNER.with(|owner| owner.replace(Some(instance)));
        Self { previous }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        WORKER_OWNER.with(|owner| owner.set(self.previous));
    }
}

/// The instance owning the current thread, if any.
#[must_use]
pub fn current_owner() -> Option<InstanceId> {
    WORKER_OWNER.with(Cell::get)
}

/// Whether the current thread is a worker of `instance`.
#[must_use]
pub fn current_thread_serves(instance: InstanceId) -> bool {
    current_owner() == Some(instance)
}
