#![forbid(unsafe_code)]
//! Request-path end-to-end: classification routing, flush ordering
//! across the durability point, reentrancy through real worker threads,
//! and the statistics surface.

use fvdo_device::testing::{InertEngine, MemoryBackingDevice, RecordingDedupeIndex};
use fvdo_device::{DeviceInstance, DeviceOptions, WorkQueue};
use fvdo_engine::{BackingDevice, DedupeIndex, EngineFacade};
use fvdo_error::VdoError;
use fvdo_types::{
    BlockCount, DeviceConfig, DispatchOutcome, Request, RequestId, RequestOp, ThreadCounts, Ticks,
    WritePolicy, DEVICE_BLOCK_SIZE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config(pool: &str, policy: WritePolicy) -> DeviceConfig {
    DeviceConfig {
        pool_name: pool.to_owned(),
        parent_device_name: format!("{pool}-dev"),
        logical_block_size: 4096,
        cache_size: BlockCount(128),
        block_map_maximum_age: 187,
        md_raid5_mode_enabled: false,
        thread_counts: ThreadCounts::default(),
        write_policy: policy,
        deduplication: false,
        physical_blocks: BlockCount(1024),
        logical_bytes: 256 * u64::from(DEVICE_BLOCK_SIZE),
    }
}

fn build(
    pool: &str,
    policy: WritePolicy,
    limit: u32,
) -> (Arc<DeviceInstance>, Arc<InertEngine>) {
    let engine = InertEngine::new();
    let backing = MemoryBackingDevice::formatted(&format!("{pool}-dev"), 1024);
    let dedupe = RecordingDedupeIndex::new();
    let instance = DeviceInstance::new(
        config(pool, policy),
        DeviceOptions {
            request_limit: limit,
            newly_formatted: true,
        },
        Arc::clone(&engine) as Arc<dyn EngineFacade>,
        backing as Arc<dyn BackingDevice>,
        dedupe as Arc<dyn DedupeIndex>,
    )
    .unwrap();
    engine.adopt_instance(instance.instance_id());
    instance.preload().unwrap();
    instance.start().unwrap();
    (instance, engine)
}

fn write(id: u64) -> Request {
    Request::data(RequestId(id), RequestOp::Write, 4096, Ticks(id))
}

fn preflush(id: u64) -> Request {
    let mut request = Request::data(RequestId(id), RequestOp::Write, 0, Ticks(id));
    request.preflush = true;
    request
}

#[test]
fn submit_outside_running_is_a_bad_state() {
    let engine = InertEngine::new();
    let backing = MemoryBackingDevice::formatted("rp-notrunning-dev", 1024);
    let dedupe = RecordingDedupeIndex::new();
    let instance = DeviceInstance::new(
        config("rp-notrunning", WritePolicy::Async),
        DeviceOptions::default(),
        engine as Arc<dyn EngineFacade>,
        backing as Arc<dyn BackingDevice>,
        dedupe as Arc<dyn DedupeIndex>,
    )
    .unwrap();

    let err = instance.map_request(write(1)).unwrap_err();
    assert!(matches!(
        err,
        VdoError::BadState {
            operation: "map_request",
            ..
        }
    ));
    // Rejected before counting: no observable side effects.
    assert_eq!(instance.stats_snapshot().incoming.write, 0);
    instance.destroy();
}

#[test]
fn invalid_requests_surface_as_parameter_errors() {
    let (instance, engine) = build("rp-invalid", WritePolicy::Async, 8);

    let mut fat_flush = Request::flush(RequestId(1), Ticks(0));
    fat_flush.payload_len = 4096;
    let err = instance.map_request(fat_flush).unwrap_err();
    assert!(matches!(err, VdoError::InvalidRequest(_)));
    assert_eq!(err.to_system_error(), -libc::EINVAL);

    let empty_write = Request::data(RequestId(2), RequestOp::Write, 0, Ticks(0));
    assert!(instance.map_request(empty_write).is_err());

    assert_eq!(engine.submission_count(), 0);
    // Invalid requests are still counted on the way in.
    assert_eq!(instance.stats_snapshot().incoming.write, 2);
    instance.destroy();
}

#[test]
fn flushes_remap_when_the_backing_device_owns_them() {
    let (instance, engine) = build("rp-passthrough", WritePolicy::Sync, 8);

    let flush = Request::flush(RequestId(1), Ticks(0));
    let outcome = instance.map_request(flush.clone()).unwrap();
    assert_eq!(outcome, DispatchOutcome::Remapped);
    // The host redirects the request; the core never completes it.
    assert!(!flush.completion.is_complete());
    assert_eq!(engine.submission_count(), 0);

    let stats = instance.stats_snapshot();
    assert_eq!(stats.incoming.flush, 1);
    assert_eq!(stats.acknowledged.flush, 1);
    assert_eq!(stats.flush_out, 1);
    instance.destroy();
}

#[test]
fn engine_owned_flushes_enter_the_pipeline() {
    let (instance, engine) = build("rp-flushown", WritePolicy::Async, 8);

    let flush = Request::flush(RequestId(1), Ticks(0));
    let outcome = instance.map_request(flush.clone()).unwrap();
    assert_eq!(outcome, DispatchOutcome::Submitted);
    assert_eq!(instance.flush_pipeline().pending(), 1);
    assert_eq!(engine.submission_count(), 1);
    assert!(!flush.completion.is_complete());

    engine.reach_durability_point(instance.flush_pipeline());
    assert_eq!(flush.completion.status(), Some(0));
    assert_eq!(instance.stats_snapshot().acknowledged.flush, 1);
    instance.destroy();
}

/// A write acknowledged before a preflush is durable by the time that
/// preflush could be acknowledged, so it survives a crash even if the
/// preflush acknowledgment never arrives.
#[test]
fn acknowledged_writes_are_durable_before_the_preflush_ack() {
    let (instance, engine) = build("rp-ordering", WritePolicy::Async, 8);

    let w1 = write(1);
    instance.map_request(w1.clone()).unwrap();
    engine.retire_data(1, instance.admission());
    assert_eq!(w1.completion.status(), Some(0));

    let p = preflush(2);
    instance.map_request(p.clone()).unwrap();
    assert_eq!(instance.flush_pipeline().pending(), 1);

    // The engine's flush work reaches its durability point, then the
    // crash hits before anyone acknowledges the preflush.
    engine.flush_to_durable();
    engine.crash_and_recover();

    assert!(!p.completion.is_complete());
    assert!(engine.is_durable(RequestId(1)), "acknowledged write lost across the flush");
    instance.destroy();
}

#[test]
fn data_requests_block_for_capacity_and_recover() {
    let (instance, engine) = build("rp-backpressure", WritePolicy::Async, 2);

    instance.map_request(write(1)).unwrap();
    instance.map_request(write(2)).unwrap();

    let third_done = Arc::new(AtomicBool::new(false));
    let third = {
        let instance = Arc::clone(&instance);
        let flag = Arc::clone(&third_done);
        std::thread::spawn(move || {
            instance.map_request(write(3)).unwrap();
            flag.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    assert!(!third_done.load(Ordering::SeqCst));

    engine.retire_data(1, instance.admission());
    third.join().unwrap();
    assert_eq!(engine.submission_count(), 2);
    assert_eq!(instance.admission().request_limiter().busy(), 2);

    engine.retire_data(2, instance.admission());
    instance.destroy();
}

/// A submit issued from a thread this instance's work queues own must
/// never block; at capacity it parks on the deadlock queue and is
/// relaunched by the completion path.
#[test]
fn worker_thread_submission_defers_instead_of_blocking() {
    let (instance, engine) = build("rp-reentry", WritePolicy::Async, 1);

    instance.map_request(write(1)).unwrap();
    assert_eq!(engine.submission_count(), 1);

    let mut queue = WorkQueue::new("reentryQ", instance.instance_id(), 1).unwrap();
    let deferred = Arc::new(AtomicBool::new(false));
    {
        let instance = Arc::clone(&instance);
        let deferred = Arc::clone(&deferred);
        queue.enqueue(move || {
            let outcome = instance.map_request(write(2)).unwrap();
            assert_eq!(outcome, DispatchOutcome::Submitted);
            deferred.store(true, Ordering::SeqCst);
        });
    }
    queue.finish();

    assert!(deferred.load(Ordering::SeqCst));
    assert_eq!(instance.admission().deferred_len(), 1);
    assert_eq!(engine.submission_count(), 1, "deferred write must wait for capacity");

    engine.retire_data(1, instance.admission());
    assert_eq!(instance.admission().deferred_len(), 0);
    assert_eq!(engine.submitted_ids(), vec![RequestId(2)]);
    assert_eq!(instance.admission().request_limiter().busy(), 1);

    engine.retire_data(1, instance.admission());
    instance.destroy();
}

#[test]
fn stats_surface_tracks_the_request_mix() {
    let (instance, engine) = build("rp-stats", WritePolicy::Async, 8);

    instance
        .map_request(Request::data(RequestId(1), RequestOp::Read, 4096, Ticks(0)))
        .unwrap();
    instance.map_request(write(2)).unwrap();
    instance
        .map_request(Request::data(
            RequestId(3),
            RequestOp::Discard,
            8192,
            Ticks(0),
        ))
        .unwrap();

    let stats = instance.stats_snapshot();
    assert_eq!(stats.incoming.read, 1);
    assert_eq!(stats.incoming.write, 2);
    assert_eq!(stats.incoming.discard, 1);
    assert_eq!(stats.requests_active, 3);
    assert_eq!(stats.discards_active, 1);
    assert_eq!(stats.max_requests_active, 3);

    engine.retire_data(3, instance.admission());
    let drained = instance.stats_snapshot();
    assert_eq!(drained.requests_active, 0);
    assert_eq!(drained.discards_active, 0);
    assert_eq!(drained.max_requests_active, 3);

    let json = serde_json::to_string(&drained).unwrap();
    assert!(json.contains("\"flush_out\""));
    instance.destroy();
}
