#![forbid(unsafe_code)]
//! Device front-end for FrankenVDO.
//!
//! This crate assembles the admission machinery into a device instance:
//! the lifecycle state machine, the per-instance work queues, the flush
//! pipeline, per-operation statistics, and the process-wide registry
//! that stops two instances from sharing one backing device.
//!
//! Lock ordering, outermost first: the lifecycle state word (atomic,
//! never a lock), the flush serialization lock, limiter internals, the
//! deadlock-queue lock. No lock is held across an engine hand-off.

mod flush;
mod instance;
mod lifecycle;
mod queues;
pub mod registry;
mod stats;
pub mod testing;

pub use flush::FlushPipeline;
pub use instance::{CompressionContext, DeviceInstance, DeviceOptions};
pub use lifecycle::{LayerState, StateCell};
pub use queues::{BufferPool, WorkQueue};
pub use stats::{DeviceStatsSnapshot, OpCounters, OpCountersSnapshot, RequestStats};
