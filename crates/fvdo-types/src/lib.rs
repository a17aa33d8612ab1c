#![forbid(unsafe_code)]
//! Request model, unit-carrying types, and device configuration for
//! FrankenVDO.
//!
//! Everything here is a plain value type: the concurrency machinery lives
//! in `fvdo-admission` and `fvdo-device`. The one exception is
//! [`RequestCompletion`], the handle a host submitter blocks on (or polls)
//! to observe the outcome of a request it was told was `Submitted`.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fixed size of one device data block in bytes.
///
/// Data payloads entering the device must be a positive multiple of this.
pub const DEVICE_BLOCK_SIZE: u32 = 4096;

/// Physical block index on the backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// A count of device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockCount(pub u64);

impl BlockCount {
    /// Convert to a byte count, returning `None` on overflow.
    #[must_use]
    pub fn to_bytes(self) -> Option<u64> {
        self.0.checked_mul(u64::from(DEVICE_BLOCK_SIZE))
    }
}

/// Monotonic coarse clock reading used for arrival-time accounting.
///
/// The host block layer stamps requests on entry; the core only compares
/// and reports these, it never reads a clock itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticks(pub u64);

/// Identifier assigned by the host submitter, unique per in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Identifier of one device instance within the process.
///
/// Worker threads are marked with the instance that owns them; the
/// admission path compares marks to detect re-entry from the instance's
/// own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

/// The operation a request asks the device to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestOp {
    Read,
    Write,
    Flush,
    Discard,
}

/// One unit of work submitted by the host block layer.
///
/// The payload itself is owned by the host and the engine; the front-end
/// only needs its length for validation and accounting. Invariant: a
/// `Flush` operation or a set `preflush` marker implies `payload_len == 0`;
/// everything else carries a positive multiple of [`DEVICE_BLOCK_SIZE`].
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub op: RequestOp,
    /// Payload size in bytes.
    pub payload_len: u32,
    /// Require all previously acknowledged writes to be durable before
    /// this request is acknowledged.
    pub preflush: bool,
    /// Force Unit Access: this request's own data must be durable before
    /// acknowledgment.
    pub fua: bool,
    pub arrival: Ticks,
    pub completion: RequestCompletion,
}

impl Request {
    /// Build a data request (read or write) of `payload_len` bytes.
    #[must_use]
    pub fn data(id: RequestId, op: RequestOp, payload_len: u32, arrival: Ticks) -> Self {
        Self {
            id,
            op,
            payload_len,
            preflush: false,
            fua: false,
            arrival,
            completion: RequestCompletion::new(),
        }
    }

    /// Build an empty flush request.
    #[must_use]
    pub fn flush(id: RequestId, arrival: Ticks) -> Self {
        Self {
            id,
            op: RequestOp::Flush,
            payload_len: 0,
            preflush: false,
            fua: false,
            arrival,
            completion: RequestCompletion::new(),
        }
    }

    /// True for `Flush` operations and for requests carrying the preflush
    /// marker; these share the empty-payload rule and the flush routing.
    #[must_use]
    pub fn is_flush(&self) -> bool {
        self.op == RequestOp::Flush || self.preflush
    }

    #[must_use]
    pub fn is_discard(&self) -> bool {
        self.op == RequestOp::Discard
    }
}

/// How the core disposed of a request it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The core took ownership and will complete the request
    /// asynchronously through its [`RequestCompletion`].
    Submitted,
    /// The host must redirect the request, unchanged, to the backing
    /// device.
    Remapped,
}

// ---------------------------------------------------------------------------
// Request completion
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CompletionState {
    /// Host-facing status: 0 on success, a negative system error code on
    /// failure. `None` while the request is still in flight.
    status: Option<i32>,
}

#[derive(Debug, Default)]
struct CompletionInner {
    state: Mutex<CompletionState>,
    done: Condvar,
}

/// Shared completion cell for a single request.
///
/// The submitter keeps one clone, the component completing the request
/// keeps the other. Completing twice is a bug; the first status wins and
/// the second is discarded with a debug assertion.
#[derive(Debug, Clone, Default)]
pub struct RequestCompletion {
    inner: Arc<CompletionInner>,
}

impl RequestCompletion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the host-facing status and wake any waiter.
    pub fn complete(&self, status: i32) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.status.is_none(), "request completed twice");
        if state.status.is_none() {
            state.status = Some(status);
        }
        drop(state);
        self.inner.done.notify_all();
    }

    /// Status if the request has completed.
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        self.inner.state.lock().status
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status().is_some()
    }

    /// Block until the request completes and return its status.
    ///
    /// The wait re-checks on a short period rather than parking
    /// indefinitely, so a waiter interrupted by a spurious wake retries
    /// cheaply instead of wedging.
    #[must_use]
    pub fn wait(&self) -> i32 {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(status) = state.status {
                return status;
            }
            let _ = self
                .inner
                .done
                .wait_for(&mut state, Duration::from_millis(1));
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Worker-thread sizing for one device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCounts {
    pub logical_zones: u32,
    pub physical_zones: u32,
    pub hash_zones: u32,
    pub cpu_threads: u32,
    pub bio_threads: u32,
    /// Zero disables the acknowledgment queue entirely.
    pub bio_ack_threads: u32,
    /// How many requests one bio thread issues before rotating to the next.
    pub bio_rotation_interval: u32,
}

impl Default for ThreadCounts {
    fn default() -> Self {
        Self {
            logical_zones: 1,
            physical_zones: 1,
            hash_zones: 1,
            cpu_threads: 1,
            bio_threads: 1,
            bio_ack_threads: 1,
            bio_rotation_interval: 64,
        }
    }
}

/// Write durability policy. Mutable across a suspend/resume cycle; every
/// other [`DeviceConfig`] field marked immutable stays fixed for the life
/// of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Data is durable when acknowledged; flushes may be delegated to the
    /// backing device.
    Sync,
    /// Data is durable only after a flush; the engine owns flush
    /// semantics.
    Async,
    /// Async without the flush guarantee.
    AsyncUnsafe,
}

impl WritePolicy {
    /// Whether the engine must process flush requests itself under this
    /// policy, as opposed to remapping them to the backing device.
    #[must_use]
    pub fn engine_owns_flushes(self) -> bool {
        matches!(self, Self::Async)
    }
}

/// Full configuration snapshot for one device instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Identity for registry lookup.
    pub pool_name: String,
    /// Backing device identifier (immutable).
    pub parent_device_name: String,
    /// Host-visible logical block size (immutable).
    pub logical_block_size: u32,
    /// Block-map cache size in blocks (immutable).
    pub cache_size: BlockCount,
    /// Block-map page maximum age (immutable).
    pub block_map_maximum_age: u32,
    /// (immutable)
    pub md_raid5_mode_enabled: bool,
    /// (immutable)
    pub thread_counts: ThreadCounts,
    pub write_policy: WritePolicy,
    /// Whether deduplication starts enabled. Consulted at start only.
    pub deduplication: bool,
    /// Growable only via prepare + grow while suspended.
    pub physical_blocks: BlockCount,
    /// Host-visible logical size in bytes; growable only, and always a
    /// multiple of [`DEVICE_BLOCK_SIZE`].
    pub logical_bytes: u64,
}

impl DeviceConfig {
    /// Check internal consistency. Called once at construction; the
    /// instance never re-validates an already-accepted snapshot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_name.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "pool_name",
                reason: "must not be empty",
            });
        }
        if self.parent_device_name.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "parent_device_name",
                reason: "must not be empty",
            });
        }
        if self.logical_block_size != 512 && self.logical_block_size != 4096 {
            return Err(ConfigError::InvalidField {
                field: "logical_block_size",
                reason: "must be 512 or 4096",
            });
        }
        if self.logical_bytes % u64::from(DEVICE_BLOCK_SIZE) != 0 {
            return Err(ConfigError::InvalidField {
                field: "logical_bytes",
                reason: "must be a multiple of the device block size",
            });
        }
        if self.physical_blocks.0 == 0 {
            return Err(ConfigError::InvalidField {
                field: "physical_blocks",
                reason: "must be nonzero",
            });
        }
        if self.thread_counts.cpu_threads == 0 {
            return Err(ConfigError::InvalidField {
                field: "thread_counts.cpu_threads",
                reason: "must be nonzero",
            });
        }
        if self.thread_counts.bio_threads == 0 {
            return Err(ConfigError::InvalidField {
                field: "thread_counts.bio_threads",
                reason: "must be nonzero",
            });
        }
        Ok(())
    }

    /// Logical size in device blocks.
    #[must_use]
    pub fn logical_blocks(&self) -> BlockCount {
        BlockCount(self.logical_bytes / u64::from(DEVICE_BLOCK_SIZE))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
