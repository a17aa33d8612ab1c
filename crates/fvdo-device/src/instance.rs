//! The device instance aggregate.
//!
//! A [`DeviceInstance`] owns everything with a lifecycle: the admission
//! controller, the flush pipeline, the per-level work queues, the buffer
//! pool, the compression contexts, and the registry claim. Construction
//! walks the init states forward; [`destroy`](DeviceInstance::destroy)
//! walks back from the highest level reached, finishing work queues at
//! their own level and freeing their storage only after everything above
//! them is gone.

use crate::flush::FlushPipeline;
use crate::lifecycle::{LayerState, StateCell};
use crate::queues::{BufferPool, WorkQueue};
use crate::registry::{self, Registration};
use crate::stats::{DeviceStatsSnapshot, RequestStats};
use fvdo_admission::{classify, AdmissionController, RequestClass, DEFAULT_REQUEST_LIMIT};
use fvdo_engine::{BackingDevice, DedupeIndex, EngineFacade};
use fvdo_error::{Result, VdoError};
use fvdo_geometry::{VolumeGeometry, GEOMETRY_BLOCK_LOCATION};
use fvdo_types::{
    BlockCount, DeviceConfig, DispatchOutcome, InstanceId, Request, DEVICE_BLOCK_SIZE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Scratch space for one cpu-queue worker's compressor. Thread-confined:
/// each worker uses only its own context.
#[derive(Debug)]
pub struct CompressionContext {
    scratch: Box<[u8]>,
}

/// Compressor working-set size per context.
const COMPRESSION_CONTEXT_SIZE: usize = 16 * 1024;

impl CompressionContext {
    fn new() -> Self {
        Self {
            scratch: vec![0_u8; COMPRESSION_CONTEXT_SIZE].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}

/// Knobs that are not part of the persistent device configuration.
#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    /// Bound on concurrently admitted requests.
    pub request_limit: u32,
    /// Suppresses the index load-or-rebuild path for volumes that were
    /// just formatted.
    pub newly_formatted: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            request_limit: DEFAULT_REQUEST_LIMIT,
            newly_formatted: false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueSet {
    request_queue: Option<WorkQueue>,
    bio_queue: Option<WorkQueue>,
    bio_ack_queue: Option<WorkQueue>,
    cpu_queue: Option<WorkQueue>,
}

fn next_instance_id() -> InstanceId {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    InstanceId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Clears the admin-busy latch on scope exit.
struct AdminGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for AdminGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// One virtualized block device.
pub struct DeviceInstance {
    instance_id: InstanceId,
    config: Mutex<DeviceConfig>,
    options: DeviceOptions,
    state: StateCell,
    admission: Arc<AdmissionController>,
    flush_pipeline: Arc<FlushPipeline>,
    engine: Arc<dyn EngineFacade>,
    dedupe: Arc<dyn DedupeIndex>,
    geometry: VolumeGeometry,
    stats: Arc<RequestStats>,
    /// Cached from the write policy so the submission path never takes
    /// the config lock.
    engine_owns_flushes: AtomicBool,
    allocations_allowed: AtomicBool,
    admin_busy: AtomicBool,
    destroyed: AtomicBool,
    prepared_logical: Mutex<Option<BlockCount>>,
    prepared_physical: Mutex<Option<BlockCount>>,
    queues: Mutex<QueueSet>,
    buffer_pool: Mutex<Option<BufferPool>>,
    compression_contexts: Mutex<Vec<CompressionContext>>,
    registration: Mutex<Option<Registration>>,
}

impl std::fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("instance", &self.instance_id.0)
            .field("state", &self.state.load().name())
            .finish_non_exhaustive()
    }
}

impl DeviceInstance {
    /// Construct an instance over `backing`, walking the init states
    /// forward. The geometry block is read synchronously here, once; the
    /// reader is not retained.
    pub fn new(
        config: DeviceConfig,
        options: DeviceOptions,
        engine: Arc<dyn EngineFacade>,
        backing: Arc<dyn BackingDevice>,
        dedupe: Arc<dyn DedupeIndex>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|err| VdoError::BadConfiguration(err.to_string()))?;
        let registration = registry::register(&config.pool_name, &backing.identity())?;
        let instance_id = next_instance_id();

        let geometry = Self::read_geometry(backing.as_ref())?;

        let stats = Arc::new(RequestStats::default());
        let admission = Arc::new(AdmissionController::new(
            instance_id,
            options.request_limit,
            Arc::clone(&engine),
        ));
        let flush_pipeline = Arc::new(FlushPipeline::new(
            Arc::clone(&engine),
            Arc::clone(&backing),
            Arc::clone(&stats),
        ));

        let thread_counts = config.thread_counts;
        let engine_owns_flushes = config.write_policy.engine_owns_flushes();
        let instance = Self {
            instance_id,
            config: Mutex::new(config),
            options,
            state: StateCell::new(),
            admission,
            flush_pipeline,
            engine,
            dedupe,
            geometry,
            stats,
            engine_owns_flushes: AtomicBool::new(engine_owns_flushes),
            allocations_allowed: AtomicBool::new(true),
            admin_busy: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            prepared_logical: Mutex::new(None),
            prepared_physical: Mutex::new(None),
            queues: Mutex::new(QueueSet::default()),
            buffer_pool: Mutex::new(None),
            compression_contexts: Mutex::new(Vec::new()),
            registration: Mutex::new(Some(registration)),
        };

        // Simple things: no ordering dependencies among them.
        instance.state.store(LayerState::SimpleInit);
        {
            debug_assert!(instance.allocations_allowed());
            let mut contexts = instance.compression_contexts.lock();
            for _ in 0..thread_counts.cpu_threads {
                contexts.push(CompressionContext::new());
            }
        }

        instance.state.store(LayerState::BufferPoolsInit);
        *instance.buffer_pool.lock() = Some(BufferPool::new(
            options.request_limit as usize,
            DEVICE_BLOCK_SIZE as usize,
        ));

        // Worker threads, one lifecycle level per queue. Each level's
        // teardown must finish its queue before lower levels free
        // anything the queue's items might still touch.
        {
            let mut queues = instance.queues.lock();
            instance.state.store(LayerState::RequestQueueInit);
            queues.request_queue = Some(WorkQueue::new("reqQ", instance_id, 1)?);

            instance.state.store(LayerState::BioDataInit);
            queues.bio_queue =
                Some(WorkQueue::new("bioQ", instance_id, thread_counts.bio_threads)?);

            instance.state.store(LayerState::BioAckQueueInit);
            if thread_counts.bio_ack_threads > 0 {
                queues.bio_ack_queue =
                    Some(WorkQueue::new("ackQ", instance_id, thread_counts.bio_ack_threads)?);
            }

            instance.state.store(LayerState::CpuQueueInit);
            queues.cpu_queue =
                Some(WorkQueue::new("cpuQ", instance_id, thread_counts.cpu_threads)?);
        }

        info!(
            target: "fvdo::instance",
            event = "instance_initialized",
            instance = instance_id.0,
            logical_zones = thread_counts.logical_zones,
            physical_zones = thread_counts.physical_zones,
            hash_zones = thread_counts.hash_zones,
            request_limit = options.request_limit
        );

        Ok(Arc::new(instance))
    }

    fn read_geometry(backing: &dyn BackingDevice) -> Result<VolumeGeometry> {
        let mut block = vec![0_u8; DEVICE_BLOCK_SIZE as usize];
        backing.read_block(GEOMETRY_BLOCK_LOCATION, &mut block)?;
        VolumeGeometry::decode(&block)
            .map_err(|err| VdoError::BadConfiguration(format!("could not load geometry: {err}")))
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    #[must_use]
    pub fn current_state(&self) -> LayerState {
        self.state.load()
    }

    /// Highest init level construction ever reached; teardown's starting
    /// point.
    #[must_use]
    pub fn highest_init_state(&self) -> LayerState {
        self.state.highest_init()
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    #[must_use]
    pub fn flush_pipeline(&self) -> &Arc<FlushPipeline> {
        &self.flush_pipeline
    }

    #[must_use]
    pub fn allocations_allowed(&self) -> bool {
        self.allocations_allowed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn compression_context_count(&self) -> usize {
        self.compression_contexts.lock().len()
    }

    #[must_use]
    pub fn config_snapshot(&self) -> DeviceConfig {
        self.config.lock().clone()
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            incoming: self.stats.incoming.snapshot(),
            acknowledged: self.stats.acknowledged.snapshot(),
            flush_out: self.stats.flush_out_count(),
            requests_active: self.admission.request_limiter().busy(),
            max_requests_active: self.admission.request_limiter().maximum(),
            discards_active: self.admission.discard_limiter().busy(),
            deferred: self.admission.deferred_len() as u64,
        }
    }

    // -----------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------

    /// Entry point from the host block layer.
    pub fn map_request(&self, request: Request) -> Result<DispatchOutcome> {
        let state = self.state.load();
        if state != LayerState::Running {
            return Err(VdoError::BadState {
                operation: "map_request",
                state: state.name(),
            });
        }

        // Count every incoming request, including ones about to be
        // rejected; this is the last chance to see them.
        self.stats.incoming.count(&request);

        let class = classify(&request, self.engine_owns_flushes.load(Ordering::Acquire))?;
        match class {
            RequestClass::FlushOwn => self.flush_pipeline.launch(request),
            RequestClass::FlushPassthrough => {
                // Never touched again after the remap; account it now.
                self.stats.acknowledged.count(&request);
                self.stats.count_flush_out();
                Ok(DispatchOutcome::Remapped)
            }
            RequestClass::Data | RequestClass::Discard => self.admission.submit(request, class),
        }
    }

    // -----------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------

    fn begin_admin(&self, operation: &'static str) -> Result<AdminGuard<'_>> {
        if self
            .admin_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VdoError::ComponentBusy(operation));
        }
        Ok(AdminGuard {
            busy: &self.admin_busy,
        })
    }

    /// Final pre-start step; legal only once construction has fully
    /// completed.
    pub fn preload(&self) -> Result<()> {
        let _guard = self.begin_admin("preload")?;
        let state = self.state.load();
        if state != LayerState::CpuQueueInit {
            return Err(VdoError::BadState {
                operation: "preload",
                state: state.name(),
            });
        }
        self.state.store(LayerState::Starting);
        Ok(())
    }

    /// Open the device for requests.
    pub fn start(&self) -> Result<()> {
        let _guard = self.begin_admin("start")?;
        let state = self.state.load();
        if state != LayerState::Starting {
            return Err(VdoError::BadState {
                operation: "start",
                state: state.name(),
            });
        }
        self.state.store(LayerState::Running);
        if self.config.lock().deduplication {
            self.dedupe.start(self.options.newly_formatted);
        }
        self.allocations_allowed.store(false, Ordering::Release);
        Ok(())
    }

    /// Drain, flush, and quiesce. `no_flush` skips the engine's metadata
    /// save, not the data flush.
    pub fn suspend(&self, no_flush: bool) -> Result<()> {
        let _guard = self.begin_admin("suspend")?;
        self.suspend_inner(no_flush)
    }

    fn suspend_inner(&self, no_flush: bool) -> Result<()> {
        let state = self.state.load();
        if state == LayerState::Suspended {
            return Ok(());
        }
        if state != LayerState::Running {
            return Err(VdoError::BadState {
                operation: "suspend",
                state: state.name(),
            });
        }

        // The device-mapper layer has already quiesced submitters; all
        // that remains is to drain what was admitted.
        self.quiesce_requests();

        let flush_result = self.flush_pipeline.synchronous_flush();
        if let Err(err) = &flush_result {
            self.engine.set_read_only(err.status_code());
        }

        let suspend_result = self.engine.suspend(!no_flush);
        self.dedupe.suspend(!no_flush);
        self.state.store(LayerState::Suspended);

        flush_result.and(suspend_result)
    }

    /// Wait for every admitted request to retire. The compression packer
    /// batches writes that would otherwise never drain, so it is
    /// disabled across the wait and restored only if it was on.
    fn quiesce_requests(&self) {
        let limiter = self.admission.request_limiter();
        if limiter.is_idle() {
            return;
        }
        let was_compressing = self.engine.set_compressing(false);
        limiter.wait_for_idle();
        if was_compressing {
            self.engine.set_compressing(true);
        }
    }

    /// Reopen a suspended device. The mirror of suspension, minus the
    /// flush.
    pub fn resume(&self) -> Result<()> {
        let _guard = self.begin_admin("resume")?;
        let state = self.state.load();
        if state == LayerState::Running {
            return Ok(());
        }
        if state != LayerState::Suspended {
            return Err(VdoError::BadState {
                operation: "resume",
                state: state.name(),
            });
        }
        self.dedupe.resume();
        self.engine.resume()?;
        self.state.store(LayerState::Running);
        Ok(())
    }

    /// Stop the device for good. A running device is suspended first.
    pub fn stop(&self) -> Result<()> {
        let _guard = self.begin_admin("stop")?;
        self.stop_inner()
    }

    fn stop_inner(&self) -> Result<()> {
        let state = self.state.load();
        match state {
            LayerState::Stopped => return Ok(()),
            LayerState::Running => {
                let _ = self.suspend_inner(false);
            }
            LayerState::Starting | LayerState::Suspended => {}
            other => {
                return Err(VdoError::BadState {
                    operation: "stop",
                    state: other.name(),
                })
            }
        }

        self.allocations_allowed.store(true, Ordering::Release);
        self.state.store(LayerState::Stopping);
        self.dedupe.stop();
        let result = self.engine.stop();
        self.state.store(LayerState::Stopped);
        result
    }

    /// Tear down every level reached during construction, in reverse.
    /// Idempotent; also invoked by `Drop`.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.state.load() {
            LayerState::Stopping => {
                error!(
                    target: "fvdo::instance",
                    event = "destroy_reentered_while_stopping",
                    instance = self.instance_id.0
                );
            }
            LayerState::Running | LayerState::Starting | LayerState::Suspended => {
                let _ = self.stop_inner();
            }
            _ => {}
        }

        // Finish phase: drain each queue at its own level, top down.
        // Work items may touch lower-level resources while draining, so
        // nothing is freed until every queue has finished.
        let highest = self.state.highest_init();
        let mut queues = self.queues.lock();
        if highest >= LayerState::CpuQueueInit {
            if let Some(queue) = queues.cpu_queue.as_mut() {
                queue.finish();
            }
        }
        if highest >= LayerState::BioAckQueueInit {
            if let Some(queue) = queues.bio_ack_queue.as_mut() {
                queue.finish();
            }
        }
        if highest >= LayerState::BioDataInit {
            if let Some(queue) = queues.bio_queue.as_mut() {
                queue.finish();
            }
        }
        if highest >= LayerState::RequestQueueInit {
            if let Some(queue) = queues.request_queue.as_mut() {
                queue.finish();
            }
        }
        if highest >= LayerState::BufferPoolsInit {
            *self.buffer_pool.lock() = None;
        }

        // Simple level, then the free phase for the queue storage.
        self.compression_contexts.lock().clear();
        self.engine.destroy();
        *self.registration.lock() = None;
        queues.cpu_queue = None;
        queues.bio_ack_queue = None;
        queues.bio_queue = None;
        queues.request_queue = None;

        info!(
            target: "fvdo::instance",
            event = "instance_destroyed",
            instance = self.instance_id.0,
            highest_init = highest.name()
        );
    }

    // -----------------------------------------------------------------
    // Resize and reconfiguration
    // -----------------------------------------------------------------

    /// Stage a logical grow. Runs outside suspension so the engine can
    /// allocate; the grow itself happens suspended.
    pub fn prepare_grow_logical(&self, new_logical_bytes: u64) -> Result<()> {
        let _guard = self.begin_admin("prepare_grow_logical")?;
        let blocks = self.check_logical_growth(new_logical_bytes)?;
        info!(
            target: "fvdo::instance",
            event = "prepare_grow_logical",
            instance = self.instance_id.0,
            blocks = blocks.0
        );
        self.engine.prepare_grow_logical(blocks)?;
        *self.prepared_logical.lock() = Some(blocks);
        Ok(())
    }

    /// Apply a staged logical grow. Only legal while suspended, and only
    /// after a matching prepare.
    pub fn grow_logical(&self, new_logical_bytes: u64) -> Result<()> {
        let _guard = self.begin_admin("grow_logical")?;
        let blocks = self.check_logical_growth(new_logical_bytes)?;
        let state = self.state.load();
        if state != LayerState::Suspended {
            return Err(VdoError::BadState {
                operation: "grow_logical",
                state: state.name(),
            });
        }
        if self.prepared_logical.lock().take() != Some(blocks) {
            return Err(VdoError::ParameterMismatch(
                "grow_logical requires a matching prepare",
            ));
        }
        self.engine.grow_logical(blocks)?;
        self.config.lock().logical_bytes = new_logical_bytes;
        info!(
            target: "fvdo::instance",
            event = "grew_logical",
            instance = self.instance_id.0,
            blocks = blocks.0
        );
        Ok(())
    }

    fn check_logical_growth(&self, new_logical_bytes: u64) -> Result<BlockCount> {
        if new_logical_bytes % u64::from(DEVICE_BLOCK_SIZE) != 0 {
            return Err(VdoError::ParameterMismatch(
                "logical size must be a multiple of the device block size",
            ));
        }
        if new_logical_bytes < self.config.lock().logical_bytes {
            return Err(VdoError::ParameterMismatch("logical size may only grow"));
        }
        Ok(BlockCount(new_logical_bytes / u64::from(DEVICE_BLOCK_SIZE)))
    }

    pub fn prepare_grow_physical(&self, new_physical: BlockCount) -> Result<()> {
        let _guard = self.begin_admin("prepare_grow_physical")?;
        self.check_physical_growth(new_physical)?;
        info!(
            target: "fvdo::instance",
            event = "prepare_grow_physical",
            instance = self.instance_id.0,
            blocks = new_physical.0
        );
        self.engine.prepare_grow_physical(new_physical)?;
        *self.prepared_physical.lock() = Some(new_physical);
        Ok(())
    }

    pub fn grow_physical(&self, new_physical: BlockCount) -> Result<()> {
        let _guard = self.begin_admin("grow_physical")?;
        self.check_physical_growth(new_physical)?;
        let state = self.state.load();
        if state != LayerState::Suspended {
            return Err(VdoError::BadState {
                operation: "grow_physical",
                state: state.name(),
            });
        }
        if self.prepared_physical.lock().take() != Some(new_physical) {
            return Err(VdoError::ParameterMismatch(
                "grow_physical requires a matching prepare",
            ));
        }
        self.engine.grow_physical(new_physical)?;
        self.config.lock().physical_blocks = new_physical;
        Ok(())
    }

    fn check_physical_growth(&self, new_physical: BlockCount) -> Result<()> {
        if new_physical < self.config.lock().physical_blocks {
            return Err(VdoError::ParameterMismatch("physical size may only grow"));
        }
        Ok(())
    }

    /// Validate a replacement configuration and, from suspension, apply
    /// the mutable parts. In the running state staged growth is prepared
    /// but nothing is applied.
    pub fn modify(&self, new_config: &DeviceConfig) -> Result<()> {
        let _guard = self.begin_admin("modify")?;
        self.prepare_to_modify(new_config)?;

        let state = self.state.load();
        match state {
            LayerState::Running => Ok(()),
            LayerState::Suspended => self.apply_modify(new_config),
            other => Err(VdoError::BadState {
                operation: "modify",
                state: other.name(),
            }),
        }
    }

    /// The immutability wall. Every rejected field leaves the instance
    /// untouched.
    fn prepare_to_modify(&self, new_config: &DeviceConfig) -> Result<()> {
        let current = self.config.lock().clone();

        if new_config.pool_name != current.pool_name {
            return Err(VdoError::ParameterMismatch("pool name cannot change"));
        }
        if new_config.parent_device_name != current.parent_device_name {
            return Err(VdoError::ParameterMismatch(
                "underlying device cannot change",
            ));
        }
        if new_config.logical_block_size != current.logical_block_size {
            return Err(VdoError::ParameterMismatch(
                "logical block size cannot change",
            ));
        }
        if new_config.cache_size != current.cache_size {
            return Err(VdoError::ParameterMismatch(
                "block map cache size cannot change",
            ));
        }
        if new_config.block_map_maximum_age != current.block_map_maximum_age {
            return Err(VdoError::ParameterMismatch(
                "block map maximum age cannot change",
            ));
        }
        if new_config.md_raid5_mode_enabled != current.md_raid5_mode_enabled {
            return Err(VdoError::ParameterMismatch("raid5 mode cannot change"));
        }
        if new_config.thread_counts != current.thread_counts {
            return Err(VdoError::ParameterMismatch(
                "thread configuration cannot change",
            ));
        }

        if new_config.logical_bytes != current.logical_bytes {
            let blocks = self.check_logical_growth(new_config.logical_bytes)?;
            self.engine.prepare_grow_logical(blocks)?;
            *self.prepared_logical.lock() = Some(blocks);
        }
        if new_config.physical_blocks != current.physical_blocks {
            self.check_physical_growth(new_config.physical_blocks)?;
            self.engine.prepare_grow_physical(new_config.physical_blocks)?;
            *self.prepared_physical.lock() = Some(new_config.physical_blocks);
        }
        Ok(())
    }

    fn apply_modify(&self, new_config: &DeviceConfig) -> Result<()> {
        let current = self.config.lock().clone();

        if new_config.write_policy != current.write_policy {
            info!(
                target: "fvdo::instance",
                event = "write_policy_changed",
                instance = self.instance_id.0,
                from = ?current.write_policy,
                to = ?new_config.write_policy
            );
            self.config.lock().write_policy = new_config.write_policy;
            self.engine_owns_flushes.store(
                new_config.write_policy.engine_owns_flushes(),
                Ordering::Release,
            );
        }

        if new_config.logical_bytes != current.logical_bytes {
            let blocks = BlockCount(new_config.logical_bytes / u64::from(DEVICE_BLOCK_SIZE));
            if self.prepared_logical.lock().take() != Some(blocks) {
                return Err(VdoError::ParameterMismatch(
                    "logical resize requires a matching prepare",
                ));
            }
            self.engine.grow_logical(blocks)?;
            self.config.lock().logical_bytes = new_config.logical_bytes;
        }

        if new_config.physical_blocks != current.physical_blocks {
            if self.prepared_physical.lock().take() != Some(new_config.physical_blocks) {
                return Err(VdoError::ParameterMismatch(
                    "physical resize requires a matching prepare",
                ));
            }
            self.engine.grow_physical(new_config.physical_blocks)?;
            self.config.lock().physical_blocks = new_config.physical_blocks;
        }
        Ok(())
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            warn!(
                target: "fvdo::instance",
                event = "instance_dropped_without_destroy",
                instance = self.instance_id.0
            );
            self.destroy();
        }
    }
}
