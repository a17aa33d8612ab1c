#![forbid(unsafe_code)]
//! Contracts between the FrankenVDO front-end and its collaborators.
//!
//! The front-end never touches block data itself; it classifies, admits,
//! and hands requests to an *engine* that deduplicates, compresses, and
//! eventually completes them. This crate defines that contract
//! ([`EngineFacade`]), the contracts of the two passive collaborators
//! (the [`BackingDevice`] underneath and the [`DedupeIndex`] alongside),
//! and the worker-thread marking scheme that lets the admission path
//! detect re-entry from an engine's own worker pool.

pub mod worker;

use fvdo_error::Result;
use fvdo_types::{BlockCount, BlockNumber, Request};

/// Admission capacity held on behalf of one request.
///
/// Permits are counted, not carried: this bundle records which limiters
/// the request drew from, so the completion path can return exactly what
/// was taken. Ownership of the recorded permits transfers to the engine
/// with the request and comes back through [`CompletionSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermitBundle {
    /// One permit from the request limiter.
    pub has_request_permit: bool,
    /// One permit from the discard limiter. A discard may run without
    /// one; the engine then takes its slower path and must not return a
    /// discard permit for it.
    pub has_discard_permit: bool,
}

impl PermitBundle {
    /// Bundle for an ordinary data request.
    #[must_use]
    pub fn request_only() -> Self {
        Self {
            has_request_permit: true,
            has_discard_permit: false,
        }
    }

    /// Bundle for a flush, which is admitted without capacity.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The return path for admission capacity.
///
/// The engine receives this handle when it is attached to an instance and
/// invokes it as requests retire. Calls may arrive from any engine
/// thread; implementations must not block beyond their own short locks.
pub trait CompletionSink: Send + Sync {
    /// Retire `count` requests that each held a request permit. The
    /// implementation may relaunch deferred work before returning spare
    /// capacity.
    fn complete_batch(&self, count: u32);

    /// Return one discard permit.
    fn release_discard_permit(&self);
}

/// The storage engine under the front-end.
///
/// `submit` takes ownership of the request and of every permit recorded
/// in the bundle, even when it returns an error; in the error case the
/// engine must still complete the request (possibly immediately), which
/// drives the normal permit-release flow. This keeps permit ownership
/// uniform across success and failure.
pub trait EngineFacade: Send + Sync + std::fmt::Debug {
    /// Accept a classified request together with its admission permits.
    /// Must eventually cause `complete_batch` (and, for a discard holding
    /// a permit, `release_discard_permit`) on the attached
    /// [`CompletionSink`]; flushes are completed through the flush
    /// acknowledgment path instead.
    fn submit(&self, request: Request, permits: PermitBundle) -> Result<()>;

    /// Toggle the compression packer. Returns the previous setting.
    fn set_compressing(&self, enable: bool) -> bool;

    /// Quiesce the engine. `save` persists all dirty metadata first.
    fn suspend(&self, save: bool) -> Result<()>;

    fn resume(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Release engine resources. Called exactly once, after `stop`.
    fn destroy(&self);

    /// Latch the fail-safe mode in which only reads of already-mapped
    /// data succeed. `error` is the status that triggered the latch.
    fn set_read_only(&self, error: i32);

    /// First phase of an online logical resize. Runs outside suspension.
    fn prepare_grow_logical(&self, blocks: BlockCount) -> Result<()>;

    /// Second phase; only legal after a matching prepare, while the
    /// device is suspended.
    fn grow_logical(&self, blocks: BlockCount) -> Result<()>;

    fn prepare_grow_physical(&self, blocks: BlockCount) -> Result<()>;

    fn grow_physical(&self, blocks: BlockCount) -> Result<()>;

    /// Whether the calling thread belongs to a worker pool owned by this
    /// engine's instance. The admission path must never block when this
    /// holds.
    fn worker_pool_contains_current(&self) -> bool;
}

/// The device the instance virtualizes.
///
/// Only two operations cross this seam from the core: the one-shot
/// synchronous geometry read during construction and the synchronous
/// preflush used around suspension. Everything else reaches the backing
/// device through the engine or by host-side remapping.
pub trait BackingDevice: Send + Sync + std::fmt::Debug {
    /// Synchronously read one block into `buf`; `buf.len()` is the block
    /// size.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Issue an empty write-preflush and block until it is durable.
    fn flush(&self) -> Result<()>;

    /// Stable identity used to refuse sharing one device between two
    /// instances.
    fn identity(&self) -> String;
}

/// The external deduplication index collaborator.
///
/// Its timeout behavior is its own; the core only drives lifecycle and
/// passes the save flag through on suspension.
pub trait DedupeIndex: Send + Sync + std::fmt::Debug {
    /// Begin index service. `create_new` suppresses the load-or-rebuild
    /// path for freshly formatted volumes.
    fn start(&self, create_new: bool);

    fn suspend(&self, save: bool);

    fn resume(&self);

    fn stop(&self);
}

/// Index collaborator that does nothing, for deduplication-disabled
/// instances and tests.
#[derive(Debug, Default)]
pub struct NoopDedupeIndex;

impl DedupeIndex for NoopDedupeIndex {
    fn start(&self, _create_new: bool) {}

    fn suspend(&self, _save: bool) {}

    fn resume(&self) {}

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_bundles() {
        assert!(PermitBundle::request_only().has_request_permit);
        assert!(!PermitBundle::request_only().has_discard_permit);
        assert_eq!(PermitBundle::empty(), PermitBundle::default());
    }
}
