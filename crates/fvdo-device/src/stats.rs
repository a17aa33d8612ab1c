//! Per-operation request counters.
//!
//! All counters are lock-free atomics updated on the submission and
//! acknowledgment paths; snapshots are taken field by field and are not
//! a consistent cut, which is fine for monotonic reporting.

use fvdo_types::{Request, RequestOp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One set of per-kind counters.
#[derive(Debug, Default)]
pub struct OpCounters {
    read: AtomicU64,
    write: AtomicU64,
    discard: AtomicU64,
    flush: AtomicU64,
    fua: AtomicU64,
}

impl OpCounters {
    /// Count one request. Reads count as reads; everything else moves
    /// data toward the device and counts as a write. Discard, flush, and
    /// FUA marks count additionally.
    pub fn count(&self, request: &Request) {
        if request.op == RequestOp::Read {
            self.read.fetch_add(1, Ordering::Relaxed);
        } else {
            self.write.fetch_add(1, Ordering::Relaxed);
        }
        if request.op == RequestOp::Discard {
            self.discard.fetch_add(1, Ordering::Relaxed);
        }
        if request.is_flush() {
            self.flush.fetch_add(1, Ordering::Relaxed);
        }
        if request.fua {
            self.fua.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> OpCountersSnapshot {
        OpCountersSnapshot {
            read: self.read.load(Ordering::Relaxed),
            write: self.write.load(Ordering::Relaxed),
            discard: self.discard.load(Ordering::Relaxed),
            flush: self.flush.load(Ordering::Relaxed),
            fua: self.fua.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCountersSnapshot {
    pub read: u64,
    pub write: u64,
    pub discard: u64,
    pub flush: u64,
    pub fua: u64,
}

/// Counters the instance maintains across its life.
#[derive(Debug, Default)]
pub struct RequestStats {
    /// Every request entering `map_request`.
    pub incoming: OpCounters,
    /// Requests acknowledged back to the host.
    pub acknowledged: OpCounters,
    /// Flushes issued to the backing device, remapped or synchronous.
    pub flush_out: AtomicU64,
}

impl RequestStats {
    pub fn count_flush_out(&self) {
        self.flush_out.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn flush_out_count(&self) -> u64 {
        self.flush_out.load(Ordering::Relaxed)
    }
}

/// Point-in-time statistics report for one device instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatsSnapshot {
    pub incoming: OpCountersSnapshot,
    pub acknowledged: OpCountersSnapshot,
    pub flush_out: u64,
    /// Requests currently holding a request permit.
    pub requests_active: u32,
    /// Highest concurrent occupancy observed.
    pub max_requests_active: u32,
    /// Discards currently holding a discard permit.
    pub discards_active: u32,
    /// Requests parked on the deadlock queue.
    pub deferred: u64,
}
