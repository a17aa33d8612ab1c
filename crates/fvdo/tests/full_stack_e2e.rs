#![forbid(unsafe_code)]
//! Full-stack test over a real file: format a backing file with a
//! geometry record through the buffered writer, bring a device instance
//! up over it, push a request mix through, and take it down.

use fvdo::{
    BackingDevice, BlockCount, BlockNumber, BufferedBlockWriter, DedupeIndex, DeviceConfig,
    DeviceInstance, DeviceOptions, DispatchOutcome, EngineFacade, IndexConfig, LayerState,
    NoopDedupeIndex, RegionId, RegionWriter, Request, RequestId, RequestOp, ThreadCounts, Ticks,
    VolumeGeometry, VolumeRegion, WritePolicy, DEVICE_BLOCK_SIZE,
};
use fvdo_device::testing::InertEngine;
use fvdo_error::{Result, VdoError};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

struct FileRegion {
    file: File,
}

impl RegionWriter for FileRegion {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

#[derive(Debug)]
struct FileBackingDevice {
    file: File,
    identity: String,
}

impl FileBackingDevice {
    fn open(path: &Path, identity: &str) -> Self {
        Self {
            file: File::options().read(true).write(true).open(path).unwrap(),
            identity: identity.to_owned(),
        }
    }
}

impl BackingDevice for FileBackingDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, block.0 * u64::from(DEVICE_BLOCK_SIZE))
            .map_err(VdoError::Io)
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all().map_err(VdoError::Io)
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

fn geometry() -> VolumeGeometry {
    VolumeGeometry {
        release_version: 3,
        nonce: 0xFEED_F00D,
        uuid: *b"full-stack-vol-0",
        regions: [
            VolumeRegion {
                id: RegionId::Index,
                start_block: BlockNumber(1),
            },
            VolumeRegion {
                id: RegionId::Data,
                start_block: BlockNumber(129),
            },
        ],
        index_config: IndexConfig {
            mem: 512,
            checkpoint_frequency: 16,
            sparse: true,
        },
    }
}

fn format_device(path: &Path, blocks: u64) {
    let file = File::create(path).unwrap();
    file.set_len(blocks * u64::from(DEVICE_BLOCK_SIZE)).unwrap();

    let mut writer =
        BufferedBlockWriter::new(FileRegion { file }, DEVICE_BLOCK_SIZE as usize).unwrap();
    writer.write(&geometry().encode()).unwrap();
    writer.finish().unwrap();
}

#[test]
fn format_boot_serve_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backing.img");
    format_device(&path, 512);

    let engine = InertEngine::new();
    let backing = Arc::new(FileBackingDevice::open(&path, "full-stack-dev"));
    let instance = DeviceInstance::new(
        DeviceConfig {
            pool_name: "full-stack".to_owned(),
            parent_device_name: "full-stack-dev".to_owned(),
            logical_block_size: 4096,
            cache_size: BlockCount(128),
            block_map_maximum_age: 187,
            md_raid5_mode_enabled: false,
            thread_counts: ThreadCounts::default(),
            write_policy: WritePolicy::Async,
            deduplication: false,
            physical_blocks: BlockCount(512),
            logical_bytes: 128 * u64::from(DEVICE_BLOCK_SIZE),
        },
        DeviceOptions {
            request_limit: 16,
            newly_formatted: true,
        },
        Arc::clone(&engine) as Arc<dyn EngineFacade>,
        backing as Arc<dyn BackingDevice>,
        Arc::new(NoopDedupeIndex) as Arc<dyn DedupeIndex>,
    )
    .unwrap();
    engine.adopt_instance(instance.instance_id());

    // The geometry written through the buffered writer came back intact.
    assert_eq!(*instance.geometry(), geometry());

    instance.preload().unwrap();
    instance.start().unwrap();
    assert_eq!(instance.current_state(), LayerState::Running);

    for id in 0..4 {
        let outcome = instance
            .map_request(Request::data(RequestId(id), RequestOp::Write, 4096, Ticks(id)))
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Submitted);
    }
    let flush = Request::flush(RequestId(100), Ticks(10));
    instance.map_request(flush.clone()).unwrap();

    engine.retire_data(4, instance.admission());
    engine.reach_durability_point(instance.flush_pipeline());
    assert_eq!(flush.completion.status(), Some(0));

    let stats = instance.stats_snapshot();
    assert_eq!(stats.incoming.write, 4 + 1);
    assert_eq!(stats.acknowledged.flush, 1);
    assert_eq!(stats.requests_active, 0);

    // Suspend flushes the real file, resume restores service.
    instance.suspend(false).unwrap();
    assert_eq!(instance.current_state(), LayerState::Suspended);
    instance.resume().unwrap();

    instance.stop().unwrap();
    instance.destroy();
    assert_eq!(instance.current_state(), LayerState::Stopped);
}
