//! Holding area for requests that arrive on an engine worker thread when
//! no admission capacity is free.
//!
//! Blocking there would deadlock: the worker that must retire a request
//! to free capacity would itself be parked waiting for capacity. Deferred
//! requests wait here instead and are relaunched by the completion path.
//!
//! Only one arrival timestamp is stored for the whole queue, taken when
//! the queue first becomes non-empty. Later entries in the same burst
//! report that older timestamp; this is an accepted statistical
//! approximation of a path that should almost never run.

use fvdo_types::{Request, Ticks};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Request>,
    arrival: Option<Ticks>,
}

/// Bounded-memory FIFO of deferred requests with one shared arrival
/// timestamp.
#[derive(Debug, Default)]
pub struct DeadlockQueue {
    state: Mutex<QueueState>,
}

impl DeadlockQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a deferred request. `arrival` is recorded only when the
    /// queue transitions from empty to non-empty.
    pub fn push(&self, request: Request, arrival: Ticks) {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            state.arrival = Some(arrival);
        }
        state.entries.push_back(request);
    }

    /// Pull the oldest deferred request, paired with the queue's shared
    /// arrival timestamp. Draining the last entry clears the timestamp.
    pub fn pop(&self) -> Option<(Request, Ticks)> {
        let mut state = self.state.lock();
        let request = state.entries.pop_front()?;
        let arrival = state.arrival.unwrap_or(request.arrival);
        if state.entries.is_empty() {
            state.arrival = None;
        }
        Some((request, arrival))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvdo_types::{RequestId, RequestOp};

    fn request(id: u64, arrival: u64) -> Request {
        Request::data(RequestId(id), RequestOp::Write, 4096, Ticks(arrival))
    }

    #[test]
    fn pop_order_equals_push_order() {
        let queue = DeadlockQueue::new();
        for id in 0..5 {
            queue.push(request(id, 100 + id), Ticks(100 + id));
        }
        for id in 0..5 {
            let (popped, _) = queue.pop().unwrap();
            assert_eq!(popped.id, RequestId(id));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn arrival_is_shared_across_a_burst() {
        let queue = DeadlockQueue::new();
        queue.push(request(0, 10), Ticks(10));
        queue.push(request(1, 25), Ticks(25));
        queue.push(request(2, 40), Ticks(40));

        // Every entry in the burst reports the first arrival, which is
        // never later than the entry's true arrival.
        for true_arrival in [10_u64, 25, 40] {
            let (_, arrival) = queue.pop().unwrap();
            assert_eq!(arrival, Ticks(10));
            assert!(arrival.0 <= true_arrival);
        }
    }

    #[test]
    fn draining_resets_the_shared_arrival() {
        let queue = DeadlockQueue::new();
        queue.push(request(0, 10), Ticks(10));
        assert_eq!(queue.pop().unwrap().1, Ticks(10));
        assert!(queue.is_empty());

        queue.push(request(1, 50), Ticks(50));
        assert_eq!(queue.pop().unwrap().1, Ticks(50));
    }

    #[test]
    fn len_tracks_contents() {
        let queue = DeadlockQueue::new();
        assert!(queue.is_empty());
        queue.push(request(0, 1), Ticks(1));
        queue.push(request(1, 2), Ticks(2));
        assert_eq!(queue.len(), 2);
        queue.pop();
        assert_eq!(queue.len(), 1);
    }
}
