//! Per-instance work queues.
//!
//! Each queue owns a small pool of named worker threads. Every worker
//! marks itself in the worker-pool registry for its whole service loop,
//! which is what makes the admission path's reentrancy test work: a
//! submit issued from inside a work item sees the mark and must not
//! block.
//!
//! Teardown is two-phase. `finish` drains remaining items and joins the
//! threads; the queue's storage is freed only when the owning instance
//! drops it, after every higher lifecycle level has torn down. Work
//! items may touch lower-level resources while draining, so the split
//! matters.

use fvdo_engine::worker::WorkerGuard;
use fvdo_error::{Result, VdoError};
use fvdo_types::InstanceId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

type WorkItem = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    finishing: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// A named pool of worker threads serving a FIFO of work items.
pub struct WorkQueue {
    name: String,
    shared: Arc<QueueShared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("pending", &self.len())
            .finish()
    }
}

impl WorkQueue {
    /// Spawn `threads` workers for `instance`. Thread names follow the
    /// `fvdo<instance>:<name><index>` convention. Spawn failure joins any
    /// workers already started and surfaces the OS error.
    pub fn new(name: &str, instance: InstanceId, threads: u32) -> Result<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads.max(1) as usize);
        for index in 0..threads.max(1) {
            let worker_shared = Arc::clone(&shared);
            let thread_name = format!("fvdo{}:{name}{index}", instance.0);
            let spawned = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::service_loop(&worker_shared, instance));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.state.lock().finishing = true;
                    shared.available.notify_all();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(VdoError::Io(err));
                }
            }
        }

        debug!(
            target: "fvdo::queues",
            event = "work_queue_started",
            queue = name,
            instance = instance.0,
            threads = threads.max(1)
        );

        Ok(Self {
            name: name.to_owned(),
            shared,
            workers,
        })
    }

    fn service_loop(shared: &QueueShared, instance: InstanceId) {
        let _mark = WorkerGuard::enter(instance);
        loop {
            let item = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(item) = state.items.pop_front() {
                        break item;
                    }
                    if state.finishing {
                        return;
                    }
                    shared.available.wait(&mut state);
                }
            };
            item();
        }
    }

    /// Queue a work item for execution on one of the workers.
    ///
    /// Items enqueued after `finish` began are dropped unrun.
    pub fn enqueue(&self, item: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.finishing {
            trace!(
                target: "fvdo::queues",
                event = "work_item_dropped_after_finish",
                queue = %self.name
            );
            return;
        }
        state.items.push_back(Box::new(item));
        drop(state);
        self.available_notify();
    }

    fn available_notify(&self) {
        self.shared.available.notify_one();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain remaining items and join the workers. Idempotent; the
    /// queue's memory is released only when the handle is dropped.
    pub fn finish(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.finishing && self.workers.is_empty() {
                return;
            }
            state.finishing = true;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!(
            target: "fvdo::queues",
            event = "work_queue_finished",
            queue = %self.name
        );
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Preallocated data buffers, one per admissible request.
///
/// Allocation happens once at the buffer-pools init level so the data
/// path never allocates; buffers cycle through the pool as requests
/// retire.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let buffers = (0..capacity)
            .map(|_| vec![0_u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            buffers: Mutex::new(buffers),
            buffer_size,
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Take a buffer; `None` when the pool is exhausted, which the
    /// admission limiter makes unreachable in normal operation.
    #[must_use]
    pub fn take(&self) -> Option<Box<[u8]>> {
        self.buffers.lock().pop()
    }

    /// Return a buffer to the pool. Buffers of the wrong size are a bug.
    pub fn put(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.buffer_size);
        self.buffers.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvdo_engine::worker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn work_items_run_on_marked_threads() {
        let instance = InstanceId(42);
        let mut queue = WorkQueue::new("testQ", instance, 2).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            queue.enqueue(move || {
                assert_eq!(worker::current_owner(), Some(instance));
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.finish();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn finish_drains_pending_items() {
        let mut queue = WorkQueue::new("drainQ", InstanceId(1), 1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let ran = Arc::clone(&ran);
            queue.enqueue(move || {
                std::thread::sleep(Duration::from_millis(1));
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.finish();
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut queue = WorkQueue::new("idemQ", InstanceId(2), 1).unwrap();
        queue.enqueue(|| {});
        queue.finish();
        queue.finish();
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_after_finish_is_dropped() {
        let mut queue = WorkQueue::new("lateQ", InstanceId(3), 1).unwrap();
        queue.finish();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            queue.enqueue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn buffer_pool_cycles() {
        let pool = BufferPool::new(4, 4096);
        assert_eq!(pool.available(), 4);
        let buffer = pool.take().unwrap();
        assert_eq!(buffer.len(), 4096);
        assert_eq!(pool.available(), 3);
        pool.put(buffer);
        assert_eq!(pool.available(), 4);
    }
}
