//! Region lifecycle across independent mappings: metadata round-trips,
//! producer shutdown with live consumers, and the named OS backings.

use std::sync::Arc;

use rust_imaging::shm::layout::{slot_size, DATA_OFFSET};
use rust_imaging::{
    BackingKind, Frame, FrameMetadata, PixelFormat, RegionRole, RingConsumer, RingProducer,
    SharedMemoryConfig, SharedMemoryRegion,
};

fn file_backed(dir: &tempfile::TempDir, name: &str, frames: usize) -> SharedMemoryConfig {
    SharedMemoryConfig {
        name: name.to_string(),
        size: DATA_OFFSET + frames * slot_size(64),
        backing: BackingKind::MappedFile,
        role: RegionRole::Producer,
        max_frame_size: 64,
        lock_in_ram: false,
        file_path: Some(dir.path().join(name)),
        ..Default::default()
    }
}

fn probe_frame() -> Frame {
    let mut frame = Frame::new(4, 4, 2, PixelFormat::Yuv).unwrap();
    frame.set_id(1);
    frame.data_mut().unwrap().fill(0x5A);
    frame.metadata = FrameMetadata {
        device_id: "dev1".to_string(),
        exposure_time_ms: 8.3,
        frame_number: 42,
        probe_position: Some([1.0, 2.0, 3.0]),
        probe_orientation: Some([0.0, 0.0, 0.0, 1.0]),
        ..Default::default()
    };
    frame.set_attribute("timecode", "01:02:03:04");
    frame
}

#[test]
fn structured_metadata_round_trips_across_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_backed(&dir, "meta_rt", 4);

    let producer_region = SharedMemoryRegion::create(&config).unwrap();
    let producer = RingProducer::new(Arc::clone(&producer_region)).unwrap();
    producer.write_frame(&probe_frame()).unwrap();

    // Independent consumer mapping of the same backing file.
    let mut consumer_config = config.clone();
    consumer_config.role = RegionRole::Consumer;
    let consumer_region = SharedMemoryRegion::open(&consumer_config).unwrap();
    let consumer = RingConsumer::attach(consumer_region);

    let frame = consumer.latest().unwrap();
    assert_eq!(frame.id(), 1);
    assert_eq!(frame.data().unwrap(), &[0x5A; 32]);

    let meta = &frame.metadata;
    assert_eq!(meta.device_id, "dev1");
    assert_eq!(meta.exposure_time_ms, 8.3);
    assert_eq!(meta.frame_number, 42);
    assert_eq!(meta.probe_position, Some([1.0, 2.0, 3.0]));
    assert_eq!(meta.probe_orientation, Some([0.0, 0.0, 0.0, 1.0]));
    assert_eq!(frame.attribute("timecode"), Some("01:02:03:04"));
}

#[test]
fn live_consumer_frame_outlives_producer_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_backed(&dir, "shutdown", 2);

    let producer_region = SharedMemoryRegion::create(&config).unwrap();
    let producer = RingProducer::new(Arc::clone(&producer_region)).unwrap();
    producer.write_frame(&probe_frame()).unwrap();

    let mut consumer_config = config.clone();
    consumer_config.role = RegionRole::Consumer;
    let consumer_region = SharedMemoryRegion::open(&consumer_config).unwrap();
    let consumer = RingConsumer::attach(Arc::clone(&consumer_region));

    let frame = consumer.latest().unwrap();

    // Producer tears down: deactivates and releases its mapping. The
    // file-backed bytes persist, and the consumer's mapping is pinned by
    // the outstanding frame.
    drop(producer);
    drop(producer_region);
    drop(consumer);
    drop(consumer_region);

    assert_eq!(frame.data().unwrap(), &[0x5A; 32]);
    assert_eq!(frame.id(), 1);
    drop(frame); // finally releases the mapping
}

#[test]
fn clone_into_slot_produces_a_mapped_copy() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_backed(&dir, "clone_slot", 4);
    let region = SharedMemoryRegion::create(&config).unwrap();

    let original = probe_frame();
    // Copy into slot 2's payload area, well away from any ring writes.
    let offset = region.payload_offset(2);
    let mapped = original.clone_into_slot(&region, offset).unwrap();

    assert_eq!(mapped.id(), original.id());
    assert_eq!(mapped.data().unwrap(), original.data().unwrap());
    assert_eq!(mapped.metadata, original.metadata);
    assert!(mapped.mapped_location().is_some());
}

#[test]
fn consumer_falls_back_when_metadata_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = file_backed(&dir, "no_meta", 4);
    config.enable_metadata = false;

    let _producer_region = SharedMemoryRegion::create(&config).unwrap();

    let mut consumer_config = config.clone();
    consumer_config.role = RegionRole::Consumer;
    let consumer_region = SharedMemoryRegion::open(&consumer_config).unwrap();

    // Without the advisory document the consumer assumes the 1080p slot
    // estimate but stays operational.
    assert!(consumer_region.max_frames() >= 1);
    assert!(consumer_region.is_active());
}

#[test]
fn posix_shm_round_trip() {
    let name = format!("imaging_test_{}", std::process::id());
    let config = SharedMemoryConfig {
        name: name.clone(),
        size: DATA_OFFSET + 4 * slot_size(64),
        backing: BackingKind::PosixShm,
        role: RegionRole::Producer,
        max_frame_size: 64,
        lock_in_ram: false,
        ..Default::default()
    };

    let producer_region = match SharedMemoryRegion::create(&config) {
        Ok(region) => region,
        Err(e) => {
            eprintln!("skipping: POSIX shm unavailable here ({e})");
            return;
        }
    };
    let producer = RingProducer::new(Arc::clone(&producer_region)).unwrap();
    producer.write_frame(&probe_frame()).unwrap();

    let mut consumer_config = config.clone();
    consumer_config.role = RegionRole::Consumer;
    let consumer_region = SharedMemoryRegion::open(&consumer_config).unwrap();
    let consumer = RingConsumer::attach(consumer_region);

    let frame = consumer.latest().unwrap();
    assert_eq!(frame.data().unwrap(), &[0x5A; 32]);

    // Producer drop unlinks the name; a fresh open must fail.
    drop(frame);
    drop(consumer);
    drop(producer);
    drop(producer_region);

    let mut reopen = config.clone();
    reopen.role = RegionRole::Consumer;
    assert!(SharedMemoryRegion::open(&reopen).is_err());
}

#[test]
fn sysv_shm_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("sysv_key");
    let config = SharedMemoryConfig {
        name: "sysv_region".to_string(),
        size: DATA_OFFSET + 4 * slot_size(64),
        backing: BackingKind::SysvShm,
        role: RegionRole::Producer,
        max_frame_size: 64,
        lock_in_ram: false,
        file_path: Some(key_path),
        ..Default::default()
    };

    let producer_region = match SharedMemoryRegion::create(&config) {
        Ok(region) => region,
        Err(e) => {
            eprintln!("skipping: System V shm unavailable here ({e})");
            return;
        }
    };
    let producer = RingProducer::new(Arc::clone(&producer_region)).unwrap();
    producer.write_frame(&probe_frame()).unwrap();

    let mut consumer_config = config.clone();
    consumer_config.role = RegionRole::Consumer;
    let consumer_region = SharedMemoryRegion::open(&consumer_config).unwrap();
    let consumer = RingConsumer::attach(consumer_region);
    assert_eq!(consumer.latest().unwrap().data().unwrap(), &[0x5A; 32]);
}
