//! In-memory collaborators for tests and benchmarks.
//!
//! [`MemoryBackingDevice`] is a byte array with a durability line:
//! writes land in the volatile set and move to the durable set on
//! `flush`. [`InertEngine`] records every hand-off, retires requests
//! only when the test says so, and tracks the durability of
//! acknowledged writes across its flush point, which is enough to
//! express the preflush ordering contract without a real data path.

use crate::FlushPipeline;
use fvdo_admission::AdmissionController;
use fvdo_engine::{
    worker, BackingDevice, CompletionSink, DedupeIndex, EngineFacade, PermitBundle,
};
use fvdo_error::{Result, VdoError};
use fvdo_geometry::{IndexConfig, RegionId, VolumeGeometry, VolumeRegion};
use fvdo_types::{BlockCount, BlockNumber, InstanceId, Request, RequestId, DEVICE_BLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A geometry record suitable for formatting test devices.
#[must_use]
pub fn test_geometry() -> VolumeGeometry {
    VolumeGeometry {
        release_version: 1,
        nonce: 0x6e6f_6e63_6531,
        uuid: *b"frankenvdo-test!",
        regions: [
            VolumeRegion {
                id: RegionId::Index,
                start_block: BlockNumber(1),
            },
            VolumeRegion {
                id: RegionId::Data,
                start_block: BlockNumber(257),
            },
        ],
        index_config: IndexConfig {
            mem: 256,
            checkpoint_frequency: 0,
            sparse: false,
        },
    }
}

/// Memory-backed device with an explicit durability line.
#[derive(Debug)]
pub struct MemoryBackingDevice {
    identity: String,
    blocks: Mutex<Vec<u8>>,
    flushes: AtomicUsize,
    fail_flush: AtomicBool,
}

impl MemoryBackingDevice {
    /// A device of `block_count` blocks with a valid geometry record
    /// already in block 0.
    #[must_use]
    pub fn formatted(identity: &str, block_count: u64) -> Arc<Self> {
        let mut blocks = vec![0_u8; (block_count * u64::from(DEVICE_BLOCK_SIZE)) as usize];
        let record = test_geometry().encode();
        blocks[..record.len()].copy_from_slice(&record);
        Arc::new(Self {
            identity: identity.to_owned(),
            blocks: Mutex::new(blocks),
            flushes: AtomicUsize::new(0),
            fail_flush: AtomicBool::new(false),
        })
    }

    /// A device whose block 0 is zeroed, for construction-failure tests.
    #[must_use]
    pub fn blank(identity: &str, block_count: u64) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.to_owned(),
            blocks: Mutex::new(vec![0_u8; (block_count * u64::from(DEVICE_BLOCK_SIZE)) as usize]),
            flushes: AtomicUsize::new(0),
            fail_flush: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn fail_next_flushes(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }
}

impl BackingDevice for MemoryBackingDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock();
        let start = (block.0 * u64::from(DEVICE_BLOCK_SIZE)) as usize;
        let end = start + buf.len();
        if end > blocks.len() {
            return Err(VdoError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past device end",
            )));
        }
        buf.copy_from_slice(&blocks[start..end]);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(VdoError::Io(std::io::Error::other("injected flush failure")));
        }
        Ok(())
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

#[derive(Debug, Default)]
struct EngineState {
    submitted: Vec<(Request, PermitBundle)>,
    /// Writes acknowledged to the host, not yet durable.
    acked_writes: BTreeSet<RequestId>,
    /// Writes on the durable side of the last flush point.
    durable_writes: BTreeSet<RequestId>,
    suspend_calls: Vec<bool>,
    resume_calls: usize,
    compressing_calls: Vec<bool>,
}

/// Engine stub: accepts hand-offs and retires them under test control.
#[derive(Debug)]
pub struct InertEngine {
    instance: Mutex<Option<InstanceId>>,
    state: Mutex<EngineState>,
    compressing: AtomicBool,
    read_only: AtomicI32,
    stopped: AtomicBool,
    destroyed: AtomicBool,
    fail_submit: AtomicBool,
    prepared_logical: Mutex<Option<BlockCount>>,
    prepared_physical: Mutex<Option<BlockCount>>,
}

impl Default for InertEngine {
    fn default() -> Self {
        Self {
            instance: Mutex::new(None),
            state: Mutex::new(EngineState::default()),
            compressing: AtomicBool::new(true),
            read_only: AtomicI32::new(0),
            stopped: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            prepared_logical: Mutex::new(None),
            prepared_physical: Mutex::new(None),
        }
    }
}

impl InertEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tell the engine which instance's worker pool it answers for.
    /// Called once the instance exists; reentrancy tests need it.
    pub fn adopt_instance(&self, instance: InstanceId) {
        *self.instance.lock() = Some(instance);
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.state.lock().submitted.len()
    }

    #[must_use]
    pub fn submitted_ids(&self) -> Vec<RequestId> {
        self.state
            .lock()
            .submitted
            .iter()
            .map(|(request, _)| request.id)
            .collect()
    }

    #[must_use]
    pub fn compressing_calls(&self) -> Vec<bool> {
        self.state.lock().compressing_calls.clone()
    }

    #[must_use]
    pub fn is_compressing(&self) -> bool {
        self.compressing.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn read_only_status(&self) -> i32 {
        self.read_only.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn suspend_calls(&self) -> Vec<bool> {
        self.state.lock().suspend_calls.clone()
    }

    #[must_use]
    pub fn resume_calls(&self) -> usize {
        self.state.lock().resume_calls
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn prepared_logical(&self) -> Option<BlockCount> {
        *self.prepared_logical.lock()
    }

    /// Retire the oldest `count` data requests: acknowledge them to the
    /// host, return their permits through `sink`.
    pub fn retire_data(&self, count: usize, sink: &AdmissionController) {
        let mut permits = 0_u32;
        let mut discard_permits = 0_u32;
        {
            let mut state = self.state.lock();
            for _ in 0..count {
                let Some((request, bundle)) = state.submitted.first().cloned() else {
                    break;
                };
                state.submitted.remove(0);
                state.acked_writes.insert(request.id);
                request.completion.complete(0);
                if bundle.has_request_permit {
                    permits += 1;
                }
                if bundle.has_discard_permit {
                    discard_permits += 1;
                }
            }
        }
        sink.complete_batch(permits);
        for _ in 0..discard_permits {
            sink.release_discard_permit();
        }
    }

    /// The durability half of the engine's flush work: every
    /// acknowledged write becomes durable. Acknowledging the waiting
    /// flushes is a separate, later step.
    pub fn flush_to_durable(&self) {
        let mut state = self.state.lock();
        let acked: Vec<RequestId> = state.acked_writes.iter().copied().collect();
        state.durable_writes.extend(acked);
    }

    /// Drive the engine's flush work to completion: reach the
    /// durability point, then acknowledge the pipeline's waiters.
    pub fn reach_durability_point(&self, pipeline: &FlushPipeline) -> usize {
        self.flush_to_durable();
        pipeline.complete_flushes(0)
    }

    /// Crash simulation: volatile state is lost, durable state survives.
    pub fn crash_and_recover(&self) {
        let mut state = self.state.lock();
        state.acked_writes.clear();
        state.submitted.clear();
    }

    #[must_use]
    pub fn is_durable(&self, id: RequestId) -> bool {
        self.state.lock().durable_writes.contains(&id)
    }
}

impl EngineFacade for InertEngine {
    fn submit(&self, request: Request, permits: PermitBundle) -> Result<()> {
        if self.fail_submit.load(Ordering::SeqCst) {
            // Even a failed hand-off owns the request; complete it with
            // the mapped error before reporting it.
            request.completion.complete(VdoError::Internal(fvdo_error::status::INTERNAL).to_system_error());
            return Err(VdoError::Internal(fvdo_error::status::INTERNAL));
        }
        if self.read_only.load(Ordering::SeqCst) != 0 && !request.is_flush() {
            request.completion.complete(VdoError::ReadOnly.to_system_error());
            return Err(VdoError::ReadOnly);
        }
        self.state.lock().submitted.push((request, permits));
        Ok(())
    }

    fn set_compressing(&self, enable: bool) -> bool {
        self.state.lock().compressing_calls.push(enable);
        self.compressing.swap(enable, Ordering::SeqCst)
    }

    fn suspend(&self, save: bool) -> Result<()> {
        self.state.lock().suspend_calls.push(save);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.state.lock().resume_calls += 1;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn set_read_only(&self, error: i32) {
        self.read_only.store(error, Ordering::SeqCst);
    }

    fn prepare_grow_logical(&self, blocks: BlockCount) -> Result<()> {
        *self.prepared_logical.lock() = Some(blocks);
        Ok(())
    }

    fn grow_logical(&self, blocks: BlockCount) -> Result<()> {
        if self.prepared_logical.lock().take() != Some(blocks) {
            return Err(VdoError::ParameterMismatch("grow without prepare"));
        }
        Ok(())
    }

    fn prepare_grow_physical(&self, blocks: BlockCount) -> Result<()> {
        *self.prepared_physical.lock() = Some(blocks);
        Ok(())
    }

    fn grow_physical(&self, blocks: BlockCount) -> Result<()> {
        if self.prepared_physical.lock().take() != Some(blocks) {
            return Err(VdoError::ParameterMismatch("grow without prepare"));
        }
        Ok(())
    }

    fn worker_pool_contains_current(&self) -> bool {
        match *self.instance.lock() {
            Some(instance) => worker::current_thread_serves(instance),
            None => false,
        }
    }
}

/// Dedupe stub counting lifecycle calls.
#[derive(Debug, Default)]
pub struct RecordingDedupeIndex {
    pub starts: Mutex<Vec<bool>>,
    pub suspends: Mutex<Vec<bool>>,
    pub resumes: AtomicUsize,
    pub stops: AtomicUsize,
}

impl RecordingDedupeIndex {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DedupeIndex for RecordingDedupeIndex {
    fn start(&self, create_new: bool) {
        self.starts.lock().push(create_new);
    }

    fn suspend(&self, save: bool) {
        self.suspends.lock().push(save);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
