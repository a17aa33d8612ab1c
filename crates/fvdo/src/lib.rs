#![forbid(unsafe_code)]
//! FrankenVDO public API facade.
//!
//! Re-exports the device front-end through a stable external interface.
//! Downstream consumers depend on this crate rather than on the
//! individual workspace members.

pub use fvdo_admission::{
    classify, AdmissionController, DeadlockQueue, Limiter, RequestClass, DEFAULT_REQUEST_LIMIT,
};
pub use fvdo_device::{
    registry, DeviceInstance, DeviceOptions, DeviceStatsSnapshot, FlushPipeline, LayerState,
    WorkQueue,
};
pub use fvdo_engine::{
    worker, BackingDevice, CompletionSink, DedupeIndex, EngineFacade, NoopDedupeIndex,
    PermitBundle,
};
pub use fvdo_error::{map_to_system_error, Result, VdoError};
pub use fvdo_geometry::{
    BlockMapState, BufferedBlockWriter, IndexConfig, RegionId, RegionWriter, VolumeGeometry,
    VolumeRegion, GEOMETRY_BLOCK_LOCATION,
};
pub use fvdo_types::{
    BlockCount, BlockNumber, DeviceConfig, DispatchOutcome, InstanceId, Request, RequestCompletion,
    RequestId, RequestOp, ThreadCounts, Ticks, WritePolicy, DEVICE_BLOCK_SIZE,
};
