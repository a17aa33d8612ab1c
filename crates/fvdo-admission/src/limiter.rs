//! Counted admission semaphore.
//!
//! A [`Limiter`] bounds the number of requests in flight and is the only
//! designed blocking point on the submission path. Waiters park on a
//! condvar whose queue is FIFO, so blocked submitters are admitted in
//! arrival order as capacity frees up.

use parking_lot::{Condvar, Mutex};
use tracing::trace;

#[derive(Debug)]
struct LimiterState {
    /// Permits currently outstanding.
    busy: u32,
    /// High-water mark of `busy`, kept for the statistics snapshot.
    maximum: u32,
}

/// A counted semaphore with polling, blocking acquire, bulk release, and
/// idle-wait.
///
/// Invariant at quiescence: `busy() + free == limit()`. `wait_for_idle`
/// returns only once no permits are outstanding; the caller must stop new
/// admissions first or the wait may never end.
#[derive(Debug)]
pub struct Limiter {
    limit: u32,
    state: Mutex<LimiterState>,
    capacity: Condvar,
    idle: Condvar,
}

impl Limiter {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: Mutex::new(LimiterState {
                busy: 0,
                maximum: 0,
            }),
            capacity: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Permits currently outstanding.
    #[must_use]
    pub fn busy(&self) -> u32 {
        self.state.lock().busy
    }

    /// Highest occupancy ever observed.
    #[must_use]
    pub fn maximum(&self) -> u32 {
        self.state.lock().maximum
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.busy() == 0
    }

    /// Take one permit, parking until one is free.
    pub fn acquire_blocking(&self) {
        let mut state = self.state.lock();
        while state.busy >= self.limit {
            self.capacity.wait(&mut state);
        }
        state.busy += 1;
        state.maximum = state.maximum.max(state.busy);
    }

    /// Take one permit without blocking. Returns `true` iff capacity was
    /// available.
    pub fn acquire_poll(&self) -> bool {
        let mut state = self.state.lock();
        if state.busy >= self.limit {
            return false;
        }
        state.busy += 1;
        state.maximum = state.maximum.max(state.busy);
        true
    }

    pub fn release_one(&self) {
        self.release_many(1);
    }

    /// Return `count` permits and wake up to `count` parked acquirers.
    pub fn release_many(&self, count: u32) {
        if count == 0 {
            return;
        }
        let now_idle = {
            let mut state = self.state.lock();
            debug_assert!(state.busy >= count, "released more permits than held");
            state.busy = state.busy.saturating_sub(count);
            state.busy == 0
        };
        for _ in 0..count {
            self.capacity.notify_one();
        }
        if now_idle {
            self.idle.notify_all();
            trace!(target: "fvdo::limiter", event = "limiter_idle", limit = self.limit);
        }
    }

    /// Park until no permits are outstanding.
    pub fn wait_for_idle(&self) {
        let mut state = self.state.lock();
        while state.busy != 0 {
            self.idle.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn poll_honors_limit() {
        let limiter = Limiter::new(2);
        assert!(limiter.acquire_poll());
        assert!(limiter.acquire_poll());
        assert!(!limiter.acquire_poll());
        assert_eq!(limiter.busy(), 2);
        limiter.release_one();
        assert!(limiter.acquire_poll());
    }

    #[test]
    fn busy_plus_free_equals_limit() {
        let limiter = Limiter::new(5);
        for _ in 0..3 {
            limiter.acquire_blocking();
        }
        let free = {
            let mut free = 0;
            while limiter.acquire_poll() {
                free += 1;
            }
            free
        };
        assert_eq!(limiter.busy(), 5);
        assert_eq!(3 + free, 5);
        limiter.release_many(5);
        assert!(limiter.is_idle());
    }

    #[test]
    fn blocked_acquire_unblocks_on_release() {
        let limiter = Arc::new(Limiter::new(1));
        limiter.acquire_blocking();

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let limiter = Arc::clone(&limiter);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                limiter.acquire_blocking();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst), "acquire did not block");

        limiter.release_one();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(limiter.busy(), 1);
    }

    #[test]
    fn release_many_wakes_multiple_waiters() {
        let limiter = Arc::new(Limiter::new(3));
        for _ in 0..3 {
            limiter.acquire_blocking();
        }

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.acquire_blocking())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        limiter.release_many(3);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.busy(), 3);
        limiter.release_many(3);
    }

    #[test]
    fn wait_for_idle_returns_once_drained() {
        let limiter = Arc::new(Limiter::new(4));
        for _ in 0..4 {
            limiter.acquire_blocking();
        }

        let waiter = {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || limiter.wait_for_idle())
        };

        std::thread::sleep(Duration::from_millis(10));
        limiter.release_many(2);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished(), "idle wait returned while permits held");
        limiter.release_many(2);
        waiter.join().unwrap();
        assert!(limiter.is_idle());
    }

    #[test]
    fn wait_for_idle_on_idle_limiter_is_immediate() {
        let limiter = Limiter::new(2);
        limiter.wait_for_idle();
    }

    #[test]
    fn maximum_tracks_high_water_mark() {
        let limiter = Limiter::new(10);
        for _ in 0..7 {
            limiter.acquire_blocking();
        }
        limiter.release_many(7);
        limiter.acquire_blocking();
        assert_eq!(limiter.maximum(), 7);
        limiter.release_one();
    }
}
