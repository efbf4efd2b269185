//! End-to-end ring protocol scenarios: drop policy, ordering across wrap,
//! zero-copy republish and cooperative backpressure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_imaging::shm::layout::{slot_size, DATA_OFFSET, FRAME_FLAG_ZERO_COPY};
use rust_imaging::{
    BackingKind, Frame, ImagingError, PixelFormat, RegionRole, RingConsumer, RingProducer,
    SharedMemoryConfig, SharedMemoryRegion,
};

fn region_config(
    dir: &tempfile::TempDir,
    name: &str,
    max_frame_size: usize,
    frames: usize,
    drop_when_full: bool,
) -> SharedMemoryConfig {
    SharedMemoryConfig {
        name: name.to_string(),
        size: DATA_OFFSET + frames * slot_size(max_frame_size),
        backing: BackingKind::MappedFile,
        role: RegionRole::Producer,
        max_frame_size,
        lock_in_ram: false,
        drop_frames_when_full: drop_when_full,
        file_path: Some(dir.path().join(name)),
        ..Default::default()
    }
}

/// 16-byte frame (4x2 at 2 bytes per pixel) with every payload byte set to
/// the low bits of `id`.
fn frame_16(id: u64) -> Frame {
    let mut frame = Frame::new(4, 2, 2, PixelFormat::Yuv).unwrap();
    frame.set_id(id);
    frame
}

#[test]
fn single_slot_ring_drops_everything_after_the_first_write() {
    let dir = tempfile::tempdir().unwrap();
    // slot_size = align_up(80 + 16, 64) = 128; exactly one slot fits.
    let config = region_config(&dir, "us_t1", 16, 1, true);
    assert_eq!(slot_size(16), 128);

    let region = SharedMemoryRegion::create(&config).unwrap();
    assert_eq!(region.max_frames(), 1);
    let producer = RingProducer::new(Arc::clone(&region)).unwrap();

    let mut successes = 0;
    let mut full = 0;
    for i in 0..10u64 {
        match producer.write_frame(&frame_16(i)) {
            Ok(()) => successes += 1,
            Err(ImagingError::BufferFull) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(full, 9);

    let stats = region.stats();
    assert_eq!(stats.dropped, 9);
    assert_eq!(stats.write_index, 1);

    let consumer = RingConsumer::attach(Arc::clone(&region));
    let latest = consumer.latest().unwrap();
    assert_eq!(latest.id(), 0);
    assert_eq!(latest.data().unwrap().len(), 16);

    // Write attempts dominate reads plus drops at every point.
    assert!(stats.total_written >= stats.total_read + stats.dropped);
}

#[test]
fn ordering_is_preserved_across_wrap() {
    let dir = tempfile::tempdir().unwrap();
    let config = region_config(&dir, "wrap4", 4, 4, true);
    let region = SharedMemoryRegion::create(&config).unwrap();
    assert_eq!(region.max_frames(), 4);
    let producer = RingProducer::new(Arc::clone(&region)).unwrap();

    let mut cursor_reader = RingConsumer::attach(Arc::clone(&region));
    cursor_reader.set_publish_cursor(true);
    let latest_reader = RingConsumer::attach(Arc::clone(&region));
    let mut last_latest_id = 0u64;

    for i in 0..10u64 {
        // payload = [i, i, i, i] as a 2x1 frame at 2 bytes per pixel
        let mut frame = Frame::new(2, 1, 2, PixelFormat::Yuv).unwrap();
        frame.set_id(i);
        frame.data_mut().unwrap().fill(i as u8);
        producer.write_frame(&frame).unwrap();

        // Cursor reader drains as fast as the producer writes and must see
        // every frame in order, with payload matching the id.
        let got = cursor_reader.next(0).unwrap();
        assert_eq!(got.id(), i);
        assert_eq!(got.data().unwrap()[0], i as u8);

        // Slot header sequence number equals the absolute ring index.
        assert_eq!(cursor_reader.header_at(i).sequence_number, i);

        // Latest polled once per write observes a non-decreasing id run.
        let latest = latest_reader.latest().unwrap();
        assert!(latest.id() >= last_latest_id);
        last_latest_id = latest.id();
    }

    let stats = region.stats();
    assert_eq!(stats.total_written, 10);
    assert_eq!(stats.total_read, 10);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn zero_copy_republish_sets_the_header_flag() {
    let dir = tempfile::tempdir().unwrap();
    let config = region_config(&dir, "republish", 16, 1, true);
    let region = SharedMemoryRegion::create(&config).unwrap();
    let producer = RingProducer::new(Arc::clone(&region)).unwrap();

    // Publish a patterned source frame.
    let mut original = frame_16(7);
    original.data_mut().unwrap().fill(0xAB);
    producer.write_frame(&original).unwrap();

    // Reader takes the mapped frame and acknowledges it so the single-slot
    // ring has room for the republish.
    let mut reader = RingConsumer::attach(Arc::clone(&region));
    reader.set_publish_cursor(true);
    let mapped = reader.next(0).unwrap();
    assert_eq!(mapped.data().unwrap(), &[0xAB; 16]);

    // Republishing the mapped frame skips the payload copy and flags the
    // header.
    producer.write_frame(&mapped).unwrap();

    let header = reader.header_at(1);
    assert_eq!(header.flags & FRAME_FLAG_ZERO_COPY, FRAME_FLAG_ZERO_COPY);

    let republished = reader.latest().unwrap();
    assert_eq!(republished.data().unwrap(), &[0xAB; 16]);
    assert_eq!(
        republished.metadata.processing_flags & FRAME_FLAG_ZERO_COPY,
        FRAME_FLAG_ZERO_COPY
    );
}

#[test]
fn cooperative_backpressure_waits_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = region_config(&dir, "coop2", 16, 2, false);
    config.write_timeout_ms = 50;
    let region = SharedMemoryRegion::create(&config).unwrap();
    let producer = RingProducer::new(Arc::clone(&region)).unwrap();

    // With the reader stalled the first two writes fill the ring.
    producer.write_frame(&frame_16(0)).unwrap();
    producer.write_frame(&frame_16(1)).unwrap();

    // The third write must wait out the full timeout before giving up.
    let start = Instant::now();
    let result = producer.write_frame(&frame_16(2));
    assert!(matches!(result, Err(ImagingError::BufferFull)));
    assert!(start.elapsed() >= Duration::from_millis(50));

    // Drain the ring after the stall.
    std::thread::sleep(Duration::from_millis(100));
    let mut reader = RingConsumer::attach(Arc::clone(&region));
    reader.set_publish_cursor(true);
    assert_eq!(reader.next(0).unwrap().id(), 0);
    assert_eq!(reader.next(0).unwrap().id(), 1);

    // Subsequent writes succeed and nothing was recorded as lost.
    producer.write_frame(&frame_16(2)).unwrap();
    assert_eq!(reader.next(0).unwrap().id(), 2);
    assert_eq!(region.stats().dropped, 0);
}

#[test]
fn concurrent_producer_and_consumer_threads() {
    let dir = tempfile::tempdir().unwrap();
    let config = region_config(&dir, "threads", 16, 8, false);
    let region = SharedMemoryRegion::create(&config).unwrap();
    let producer = RingProducer::new(Arc::clone(&region)).unwrap();

    const FRAMES: u64 = 200;

    let consumer_region = Arc::clone(&region);
    let consumer = std::thread::spawn(move || {
        let mut reader = RingConsumer::attach(consumer_region);
        reader.set_publish_cursor(true);
        let mut ids = Vec::new();
        while ids.len() < FRAMES as usize {
            match reader.next(1000) {
                Ok(frame) => ids.push(frame.id()),
                Err(e) => panic!("consumer error: {e}"),
            }
        }
        ids
    });

    for i in 0..FRAMES {
        producer
            .write_frame_with_timeout(&frame_16(i), 1000)
            .unwrap();
    }

    let ids = consumer.join().unwrap();
    let expected: Vec<u64> = (0..FRAMES).collect();
    assert_eq!(ids, expected);

    let stats = region.stats();
    assert_eq!(stats.total_written, FRAMES);
    assert!(stats.total_written >= stats.total_read + stats.dropped);
}
