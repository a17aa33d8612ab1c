#![forbid(unsafe_code)]
//! Request admission and dispatch for FrankenVDO.
//!
//! The admission controller is the gate between the host block layer and
//! the storage engine. It bounds in-flight work with two counted
//! limiters, takes a non-blocking detour for requests that arrive on the
//! engine's own worker threads (blocking there would deadlock), and
//! recycles capacity into deferred work on the completion path.
//!
//! Lock ordering, outermost first: limiter internal lock, then the
//! deadlock-queue lock. Neither is ever held across an engine hand-off.

mod classify;
mod deadlock_queue;
mod limiter;

pub use classify::{classify, RequestClass};
pub use deadlock_queue::DeadlockQueue;
pub use limiter::Limiter;

use fvdo_engine::{CompletionSink, EngineFacade, PermitBundle};
use fvdo_error::Result;
use fvdo_types::{DispatchOutcome, InstanceId, Request};
use std::sync::Arc;
use tracing::warn;

/// Default bound on in-flight requests: half the number of block-map
/// cache pages, so every in-progress operation can touch two pages.
pub const DEFAULT_REQUEST_LIMIT: u32 = 2000;

/// The discard bound is three quarters of the request bound.
#[must_use]
pub fn discard_limit_for(request_limit: u32) -> u32 {
    request_limit / 4 * 3
}

/// Gates new requests into the engine and returns capacity as they
/// retire.
///
/// Permit ownership is uniform: once `submit` hands a request to the
/// engine, the engine owns the recorded permits whether or not the
/// hand-off reported an error, and returns them through the
/// [`CompletionSink`] methods when the request completes.
#[derive(Debug)]
pub struct AdmissionController {
    instance: InstanceId,
    request_limiter: Limiter,
    discard_limiter: Limiter,
    deadlock_queue: DeadlockQueue,
    engine: Arc<dyn EngineFacade>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(instance: InstanceId, request_limit: u32, engine: Arc<dyn EngineFacade>) -> Self {
        Self {
            instance,
            request_limiter: Limiter::new(request_limit),
            discard_limiter: Limiter::new(discard_limit_for(request_limit)),
            deadlock_queue: DeadlockQueue::new(),
            engine,
        }
    }

    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    #[must_use]
    pub fn request_limiter(&self) -> &Limiter {
        &self.request_limiter
    }

    #[must_use]
    pub fn discard_limiter(&self) -> &Limiter {
        &self.discard_limiter
    }

    /// Deferred requests currently parked for deadlock avoidance.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deadlock_queue.len()
    }

    /// Admit a data or discard request and hand it to the engine.
    ///
    /// Blocks for capacity when called from an ordinary host thread;
    /// never blocks when called from one of this instance's engine worker
    /// threads.
    pub fn submit(&self, request: Request, class: RequestClass) -> Result<DispatchOutcome> {
        debug_assert!(matches!(class, RequestClass::Data | RequestClass::Discard));
        let is_discard = class == RequestClass::Discard;

        if self.engine.worker_pool_contains_current() {
            return self.submit_from_worker(request, is_discard);
        }

        // Take the discard permit first: a discard must never hold a
        // request permit while parked on the discard limiter, or it
        // would stall forward progress for the whole device.
        if is_discard {
            self.discard_limiter.acquire_blocking();
        }
        self.request_limiter.acquire_blocking();

        let permits = PermitBundle {
            has_request_permit: true,
            has_discard_permit: is_discard,
        };
        self.engine.submit(request, permits)?;
        Ok(DispatchOutcome::Submitted)
    }

    /// Non-blocking admission for requests arriving on one of the
    /// instance's own worker threads. Reaching this path at all suggests
    /// erroneous engine behavior, but parking here would deadlock: the
    /// thread that must retire a request to free capacity would itself
    /// be waiting for capacity. So the request is either admitted
    /// immediately or parked on the deadlock queue.
    fn submit_from_worker(&self, request: Request, is_discard: bool) -> Result<DispatchOutcome> {
        warn!(
            target: "fvdo::admission",
            event = "submit_from_worker_thread",
            instance = self.instance.0,
            request = request.id.0
        );

        if !self.request_limiter.acquire_poll() {
            let arrival = request.arrival;
            self.deadlock_queue.push(request, arrival);
            warn!(
                target: "fvdo::admission",
                event = "request_deferred_to_avoid_deadlock",
                instance = self.instance.0,
                deferred = self.deadlock_queue.len()
            );
            return Ok(DispatchOutcome::Submitted);
        }

        // Best effort only: a discard may run without a discard permit,
        // in which case the engine takes its slower path.
        let has_discard_permit = is_discard && self.discard_limiter.acquire_poll();
        let permits = PermitBundle {
            has_request_permit: true,
            has_discard_permit,
        };
        self.engine.submit(request, permits)?;
        Ok(DispatchOutcome::Submitted)
    }

    /// Relaunch one deferred request using a permit that just freed up.
    /// Returns `false` when the queue is empty.
    fn relaunch_one_deferred(&self) -> bool {
        let Some((request, _arrival)) = self.deadlock_queue.pop() else {
            return false;
        };
        let has_discard_permit = request.is_discard() && self.discard_limiter.acquire_poll();
        let permits = PermitBundle {
            has_request_permit: true,
            has_discard_permit,
        };
        if let Err(err) = self.engine.submit(request, permits) {
            // The engine owns the request and its permits regardless;
            // it completes the request with the error itself.
            warn!(
                target: "fvdo::admission",
                event = "deferred_relaunch_failed",
                instance = self.instance.0,
                error = %err
            );
        }
        true
    }
}

impl CompletionSink for AdmissionController {
    /// Retire `count` requests. Freed capacity feeds parked deferred
    /// requests first; only the remainder wakes blocked submitters.
    fn complete_batch(&self, count: u32) {
        let mut remaining = count;
        while remaining > 0 {
            if !self.relaunch_one_deferred() {
                break;
            }
            remaining -= 1;
        }
        if remaining > 0 {
            self.request_limiter.release_many(remaining);
        }
    }

    fn release_discard_permit(&self) {
        self.discard_limiter.release_one();
    }
}
