//! The single-producer / multi-consumer ring protocol.
//!
//! The ring is not a conventional bounded queue: readers do not cooperate on
//! a shared tail. The producer monotonically advances `write_index`; readers
//! either take the most recent fully-written slot ([`RingConsumer::latest`])
//! or follow a per-reader local cursor ([`RingConsumer::next`]). The control
//! block's `read_index` is advisory: callback consumers publish their cursor
//! through it so the producer can express backpressure, pull consumers may
//! ignore it entirely.
//!
//! # Ordering
//!
//! `write_index` is the single ordering authority. The producer's
//! release-store of `write_index` happens-after every byte written to the
//! slot and its header; a reader's acquire-load of `write_index`
//! happens-before any load from the slot. Slot reuse is safe for the
//! producer because its next release-store for the same physical slot
//! happens-after its writes to it. A reader holding a mapped [`Frame`] for
//! an old slot is **not** protected: once the producer has advanced
//! `max_frames` past the frame's index (the overwrite horizon), the payload
//! may be rewritten under the reader. Honoring that horizon is the reader's
//! contract.
//!
//! The producer's publish path takes no locks and never suspends; the only
//! bounded wait is the cooperative full-ring path, which sleeps in 1 ms
//! steps up to the configured timeout.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::layout::{FrameHeader, LastFrameMetadata, FRAME_FLAG_ZERO_COPY, FRAME_HEADER_SIZE};
use super::region::SharedMemoryRegion;
use crate::error::{ImagingError, Result};
use crate::frame::{now_ns, Frame, PixelFormat};

/// Sleep granularity of every bounded wait in the protocol.
const POLL_STEP: Duration = Duration::from_millis(1);

/// Callback invoked with each frame delivered to a callback consumer.
pub type ConsumerCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Producer side of the ring. One per region; concurrent producers on the
/// same region are undefined and are not defended against.
pub struct RingProducer {
    region: Arc<SharedMemoryRegion>,
    /// Region metadata document with the creation-time fields preserved;
    /// immutable here, cloned per publish to carry the `last_frame` object.
    base_metadata: super::layout::RegionMetadata,
}

impl RingProducer {
    pub fn new(region: Arc<SharedMemoryRegion>) -> Result<Self> {
        if region.role() != crate::config::RegionRole::Producer {
            return Err(ImagingError::InvalidArgument(
                "ring producer requires a producer-role region".to_string(),
            ));
        }
        let base_metadata = region
            .read_region_metadata()
            .unwrap_or_else(|| region.base_metadata());
        Ok(Self {
            region,
            base_metadata,
        })
    }

    pub fn region(&self) -> &Arc<SharedMemoryRegion> {
        &self.region
    }

    /// Write a frame using the region's configured timeout.
    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.write_frame_with_timeout(frame, self.region.write_timeout_ms())
    }

    /// Write a frame into the next slot.
    ///
    /// When the ring is full: with `drop_frames_when_full` the write counts
    /// a drop and returns `BufferFull` immediately; otherwise it sleeps in
    /// 1 ms steps up to `timeout_ms` waiting for the advisory `read_index`
    /// to advance, then returns `BufferFull`. Oversized payloads are
    /// rejected with `InvalidSize` without advancing the ring.
    pub fn write_frame_with_timeout(&self, frame: &Frame, timeout_ms: u64) -> Result<()> {
        let region = &self.region;
        let control = region.control();

        let payload_capacity = region.slot_size() - FRAME_HEADER_SIZE;
        let data_size = frame.data_size();
        if data_size > payload_capacity {
            return Err(ImagingError::InvalidSize(format!(
                "frame payload of {data_size} bytes exceeds slot capacity {payload_capacity}"
            )));
        }

        control.total_written.fetch_add(1, Ordering::Relaxed);

        let max_frames = region.max_frames();
        let mut waited_ms = 0u64;
        let write_index = loop {
            let w = control.write_index.load(Ordering::Acquire);
            let r = control.read_index.load(Ordering::Acquire);
            let in_flight = w.saturating_sub(r);
            if in_flight < max_frames {
                break w;
            }
            if region.drop_frames_when_full() {
                control.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(ImagingError::BufferFull);
            }
            if waited_ms >= timeout_ms {
                debug!(
                    region = %region.name(),
                    waited_ms,
                    "cooperative write timed out with the ring still full"
                );
                return Err(ImagingError::BufferFull);
            }
            std::thread::sleep(POLL_STEP);
            waited_ms += 1;
        };

        let payload_offset = region.payload_offset(write_index);
        let mut flags = 0u32;

        match frame.mapped_location() {
            Some((frame_region, frame_offset)) if Arc::ptr_eq(frame_region, region) => {
                // The payload already lives in this region: republish
                // zero-copy. When the source slot is not the destination
                // slot the bytes still have to move, overlap-safe.
                flags |= FRAME_FLAG_ZERO_COPY;
                if frame_offset != payload_offset {
                    region.copy_within(frame_offset, payload_offset, data_size)?;
                }
            }
            _ => {
                let payload = frame.data()?;
                region.write_bytes(payload_offset, payload)?;
            }
        }

        let header = FrameHeader {
            frame_id: frame.id(),
            timestamp_ns: frame.timestamp_ns(),
            width: frame.width(),
            height: frame.height(),
            bytes_per_pixel: frame.bytes_per_pixel(),
            data_size: data_size as u32,
            format_code: frame.format().code(),
            flags,
            sequence_number: write_index,
            metadata_offset: 0,
            metadata_size: 0,
            reserved: [0; 3],
        };
        region.write_header(write_index, &header);

        if region.metadata_enabled() {
            let mut doc = self.base_metadata.clone();
            doc.last_frame = Some(LastFrameMetadata {
                width: header.width,
                height: header.height,
                format: frame.format().name().to_string(),
                timestamp: header.timestamp_ns,
                id: header.frame_id,
                sequence_number: write_index,
                metadata: frame.metadata.clone(),
            });
            if let Err(e) = region.write_region_metadata(&doc) {
                // Metadata is advisory; a publish never fails because of it.
                warn!(region = %region.name(), error = %e, "last_frame metadata update failed");
            }
        }

        control
            .last_write_time_ns
            .store(now_ns(), Ordering::Release);
        // Publication point: everything written above becomes visible to
        // readers that acquire-load this index.
        control
            .write_index
            .store(write_index + 1, Ordering::Release);

        let read_index = control.read_index.load(Ordering::Relaxed);
        control.frame_count.store(
            (write_index + 1).saturating_sub(read_index),
            Ordering::Relaxed,
        );

        Ok(())
    }
}

/// Build a mapped frame over the slot for absolute ring index `index`.
fn read_slot(region: &Arc<SharedMemoryRegion>, index: u64) -> Result<Frame> {
    let header = region.header_at(index);
    let format = PixelFormat::from_code(header.format_code);
    let payload_offset = region.payload_offset(index);

    let mut frame = Frame::from_mapped(
        Arc::clone(region),
        payload_offset,
        header.data_size as usize,
        header.width,
        header.height,
        header.bytes_per_pixel,
        format,
    )?;
    frame.set_id(header.frame_id);
    frame.set_timestamp_ns(header.timestamp_ns);

    // The structured metadata travels through the advisory last_frame
    // object; it is only recoverable for the most recently published frame.
    if region.metadata_enabled() {
        if let Some(last) = region
            .read_region_metadata()
            .and_then(|meta| meta.last_frame)
        {
            if last.id == header.frame_id && last.sequence_number == header.sequence_number {
                frame.metadata = last.metadata;
            }
        }
    }
    frame.metadata.processing_flags = header.flags;

    Ok(frame)
}

/// Consumer side of the ring: latest-frame reads plus a local cursor.
///
/// The cursor is seeded from the producer's advisory `read_index` at attach
/// time. With [`set_publish_cursor`](Self::set_publish_cursor) the consumer
/// publishes its cursor back to the control block so the producer observes
/// backpressure; callback consumers always publish.
pub struct RingConsumer {
    region: Arc<SharedMemoryRegion>,
    cursor: u64,
    publish_cursor: bool,
    callback: Option<CallbackHandle>,
}

struct CallbackHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RingConsumer {
    pub fn attach(region: Arc<SharedMemoryRegion>) -> Self {
        let cursor = region.control().read_index.load(Ordering::Acquire);
        Self {
            region,
            cursor,
            publish_cursor: false,
            callback: None,
        }
    }

    pub fn region(&self) -> &Arc<SharedMemoryRegion> {
        &self.region
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Publish the local cursor to the control block after each read so the
    /// producer can see backpressure.
    pub fn set_publish_cursor(&mut self, publish: bool) {
        self.publish_cursor = publish;
    }

    /// Read the most recent fully-written frame without touching any
    /// cursor. `BufferEmpty` until the first publish.
    pub fn latest(&self) -> Result<Frame> {
        let w = self.region.control().write_index.load(Ordering::Acquire);
        if w == 0 {
            return Err(ImagingError::BufferEmpty);
        }
        read_slot(&self.region, w - 1)
    }

    /// Copy of the slot header for absolute ring index `index`, for
    /// diagnostics and tests.
    pub fn header_at(&self, index: u64) -> FrameHeader {
        self.region.header_at(index)
    }

    /// Read the next frame at the local cursor.
    ///
    /// With `wait_ms == 0` an empty ring answers `BufferEmpty`; otherwise
    /// the call sleep-polls in 1 ms steps and answers `Timeout` on expiry.
    pub fn next(&mut self, wait_ms: u64) -> Result<Frame> {
        let control = self.region.control();
        let mut waited_ms = 0u64;
        loop {
            let w = control.write_index.load(Ordering::Acquire);
            if self.cursor < w {
                break;
            }
            if wait_ms == 0 {
                return Err(ImagingError::BufferEmpty);
            }
            if waited_ms >= wait_ms {
                return Err(ImagingError::Timeout);
            }
            std::thread::sleep(POLL_STEP);
            waited_ms += 1;
        }

        let frame = read_slot(&self.region, self.cursor)?;
        self.cursor += 1;
        control.total_read.fetch_add(1, Ordering::Relaxed);
        control.last_read_time_ns.store(now_ns(), Ordering::Relaxed);
        if self.publish_cursor {
            control.read_index.store(self.cursor, Ordering::Release);
        }
        Ok(frame)
    }

    /// Deliver every new frame to `callback` from a notification thread.
    ///
    /// The thread polls the producer index every millisecond, delivers
    /// frames in order, and publishes the advisory `read_index` after each
    /// one. Callback panics are caught and logged; delivery continues.
    pub fn set_frame_callback(&mut self, callback: ConsumerCallback) -> Result<()> {
        if self.callback.is_some() {
            return Err(ImagingError::AlreadyExists("frame callback".to_string()));
        }

        let region = Arc::clone(&self.region);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let mut cursor = self.cursor;

        let thread = std::thread::Builder::new()
            .name("shm-notify".to_string())
            .spawn(move || {
                if region.realtime_threads() {
                    crate::threading::apply_realtime_priority();
                }
                let control = region.control();
                while !thread_stop.load(Ordering::Relaxed) {
                    let w = control.write_index.load(Ordering::Acquire);
                    while cursor < w {
                        match read_slot(&region, cursor) {
                            Ok(frame) => {
                                let cb = Arc::clone(&callback);
                                if catch_unwind(AssertUnwindSafe(move || cb(frame))).is_err() {
                                    error!(
                                        region = %region.name(),
                                        "consumer frame callback panicked"
                                    );
                                }
                            }
                            Err(e) => {
                                warn!(region = %region.name(), error = %e, "slot read failed");
                            }
                        }
                        cursor += 1;
                        control.total_read.fetch_add(1, Ordering::Relaxed);
                        control.last_read_time_ns.store(now_ns(), Ordering::Relaxed);
                        control.read_index.store(cursor, Ordering::Release);
                    }
                    std::thread::sleep(POLL_STEP);
                }
            })
            .map_err(|e| ImagingError::Internal(format!("notification thread spawn: {e}")))?;

        self.callback = Some(CallbackHandle { stop, thread });
        Ok(())
    }

    /// Stop and join the notification thread, if one is running.
    pub fn clear_frame_callback(&mut self) {
        if let Some(handle) = self.callback.take() {
            handle.stop.store(true, Ordering::Relaxed);
            let _ = handle.thread.join();
        }
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.clear_frame_callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackingKind, RegionRole, SharedMemoryConfig};
    use crate::shm::layout::{slot_size, DATA_OFFSET};
    use parking_lot::Mutex;

    fn test_region(
        dir: &tempfile::TempDir,
        name: &str,
        max_frame_size: usize,
        frames: usize,
        drop_when_full: bool,
    ) -> Arc<SharedMemoryRegion> {
        let config = SharedMemoryConfig {
            name: name.to_string(),
            size: DATA_OFFSET + frames * slot_size(max_frame_size),
            backing: BackingKind::MappedFile,
            role: RegionRole::Producer,
            max_frame_size,
            lock_in_ram: false,
            drop_frames_when_full: drop_when_full,
            file_path: Some(dir.path().join(name)),
            ..Default::default()
        };
        SharedMemoryRegion::create(&config).unwrap()
    }

    #[test]
    fn test_write_publishes_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let region = test_region(&dir, "ring_seq", 16, 4, true);
        let producer = RingProducer::new(Arc::clone(&region)).unwrap();
        let mut consumer = RingConsumer::attach(Arc::clone(&region));
        consumer.set_publish_cursor(true);

        for i in 0..4u64 {
            let mut frame = Frame::new(4, 2, 2, PixelFormat::Yuv).unwrap();
            frame.set_id(i);
            producer.write_frame(&frame).unwrap();
            let got = consumer.next(0).unwrap();
            assert_eq!(got.id(), i);
            assert_eq!(consumer.header_at(i).sequence_number, i);
        }
    }

    #[test]
    fn test_oversized_payload_rejected_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let region = test_region(&dir, "ring_oversize", 16, 2, true);
        let producer = RingProducer::new(Arc::clone(&region)).unwrap();

        // slot capacity is 128 - 80 = 48 bytes for a 16-byte bound.
        let frame = Frame::new(49, 1, 1, PixelFormat::Yuv).unwrap();
        assert!(matches!(
            producer.write_frame(&frame),
            Err(ImagingError::InvalidSize(_))
        ));
        assert_eq!(region.stats().write_index, 0);
    }

    #[test]
    fn test_latest_on_empty_ring() {
        let dir = tempfile::tempdir().unwrap();
        let region = test_region(&dir, "ring_empty", 16, 2, true);
        let consumer = RingConsumer::attach(region);
        assert!(matches!(
            consumer.latest(),
            Err(ImagingError::BufferEmpty)
        ));
    }

    #[test]
    fn test_next_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let region = test_region(&dir, "ring_timeout", 16, 2, true);
        let mut consumer = RingConsumer::attach(region);

        assert!(matches!(consumer.next(0), Err(ImagingError::BufferEmpty)));

        let start = std::time::Instant::now();
        assert!(matches!(consumer.next(20), Err(ImagingError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_callback_consumer_delivers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let region = test_region(&dir, "ring_callback", 16, 8, true);
        let producer = RingProducer::new(Arc::clone(&region)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let mut consumer = RingConsumer::attach(Arc::clone(&region));
        consumer
            .set_frame_callback(Arc::new(move |frame: Frame| {
                seen_cb.lock().push(frame.id());
            }))
            .unwrap();

        for i in 0..5u64 {
            let mut frame = Frame::new(4, 2, 2, PixelFormat::Yuv).unwrap();
            frame.set_id(i);
            producer.write_frame(&frame).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        consumer.clear_frame_callback();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        // Callback readers publish their cursor.
        assert_eq!(region.stats().read_index, 5);
    }
}
