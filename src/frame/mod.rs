//! Frame objects with zero-copy payload handling.
//!
//! A [`Frame`] is an immutable-after-publish record: identity (id, capture
//! timestamp), geometry (width, height, bytes per pixel, format) and a
//! payload handle. The payload handle is a closed variant set:
//!
//! - **Owned**: the frame allocated the bytes and frees them on drop.
//! - **Borrowed**: the bytes belong to an upstream producer (typically a
//!   vendor SDK buffer); the frame holds a one-shot release hook that runs
//!   exactly once on drop, on every destruction path including unwinding.
//! - **Mapped**: the bytes live inside a shared-memory region slot; the
//!   frame holds a strong reference to the region so the mapping outlives
//!   the frame, and the data pointer is resolved through the region on
//!   every access.
//! - **Gpu** / **Dma**: declared variants for device-resident payloads.
//!   Data access answers `NotSupported`; the transport contract is unchanged
//!   when they are filled in.
//!
//! A mapped frame's validity window is bounded by the producer's overwrite
//! horizon: the protocol does not detect a producer lapping the slot. See
//! the ring module for the contract.

pub mod metadata;

pub use metadata::FrameMetadata;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ImagingError, Result};
use crate::shm::region::SharedMemoryRegion;

/// Pixel formats carried over the transport.
///
/// The numeric codes are part of the wire format: producers store the code
/// in the slot header, readers map it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit YUV 4:2:2 (`YUV` / `YUV422`).
    #[serde(rename = "YUV")]
    Yuv,
    /// 8-bit BGRA / RGB / RGBA.
    #[serde(rename = "BGRA")]
    Bgra,
    /// 10-bit YUV 4:2:2 (`YUV10` / `YUV422_10`).
    #[serde(rename = "YUV10")]
    Yuv10,
    /// 10-bit RGB.
    #[serde(rename = "RGB10")]
    Rgb10,
    /// Catch-all for formats this build does not know.
    #[serde(rename = "Unknown")]
    Unknown,
}

impl PixelFormat {
    /// Wire code stored in slot headers.
    pub fn code(&self) -> u32 {
        match self {
            PixelFormat::Yuv => 0x01,
            PixelFormat::Bgra => 0x02,
            PixelFormat::Yuv10 => 0x03,
            PixelFormat::Rgb10 => 0x04,
            PixelFormat::Unknown => 0xFF,
        }
    }

    /// Reverse mapping from the wire code; anything unrecognized is
    /// `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x01 => PixelFormat::Yuv,
            0x02 => PixelFormat::Bgra,
            0x03 => PixelFormat::Yuv10,
            0x04 => PixelFormat::Rgb10,
            _ => PixelFormat::Unknown,
        }
    }

    /// Parse the vendor-style format names.
    pub fn from_name(name: &str) -> Self {
        match name {
            "YUV" | "YUV422" => PixelFormat::Yuv,
            "RGB" | "BGRA" | "RGBA" => PixelFormat::Bgra,
            "YUV10" | "YUV422_10" => PixelFormat::Yuv10,
            "RGB10" => PixelFormat::Rgb10,
            _ => PixelFormat::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv => "YUV",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Yuv10 => "YUV10",
            PixelFormat::Rgb10 => "RGB10",
            PixelFormat::Unknown => "Unknown",
        }
    }

    /// Conservative per-pixel byte estimate used for sizing defaults.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Yuv => 2,
            PixelFormat::Bgra => 4,
            PixelFormat::Yuv10 => 4,
            PixelFormat::Rgb10 => 4,
            PixelFormat::Unknown => 2,
        }
    }
}

/// Discriminant of a frame's payload handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDataKind {
    Owned,
    Borrowed,
    Mapped,
    Gpu,
    Dma,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

enum FrameData {
    Owned(Vec<u8>),
    Borrowed {
        ptr: *mut u8,
        len: usize,
        release: Option<ReleaseHook>,
    },
    Mapped {
        region: Arc<SharedMemoryRegion>,
        offset: usize,
        len: usize,
    },
    Gpu,
    Dma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Read,
    Write,
}

/// A captured frame. See the module docs for the payload variants.
pub struct Frame {
    id: u64,
    timestamp_ns: u64,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    format: PixelFormat,
    data: FrameData,
    lock: LockState,
    pub metadata: FrameMetadata,
}

// SAFETY: Owned payloads are plain Vecs and Mapped payloads hold an Arc to a
// Send + Sync region. Borrowed payloads carry a raw pointer; the constructor
// contract requires the bytes to remain valid and accessible from any thread
// until the release hook runs, and the hook itself is Send.
unsafe impl Send for Frame {}
// SAFETY: every &self method is read-only; mutation (payload, lock state,
// the one-shot release hook) requires &mut self or the drop path.
unsafe impl Sync for Frame {}

impl Frame {
    /// Allocate a new owned frame of `width * height * bytes_per_pixel`
    /// zeroed bytes.
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32, format: PixelFormat) -> Result<Self> {
        let size = width as usize * height as usize * bytes_per_pixel as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| ImagingError::OutOfMemory)?;
        buf.resize(size, 0);

        Ok(Self {
            id: 0,
            timestamp_ns: now_ns(),
            width,
            height,
            bytes_per_pixel,
            format,
            data: FrameData::Owned(buf),
            lock: LockState::Unlocked,
            metadata: FrameMetadata::default(),
        })
    }

    /// Wrap bytes owned by an upstream producer.
    ///
    /// The release hook is invoked exactly once when the frame is destroyed,
    /// on every destruction path including unwinding. A hook that panics is
    /// caught and logged; it never surfaces as a frame error because the
    /// frame is already being destroyed.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `len` readable bytes that stay valid and
    /// accessible from any thread until the release hook has run.
    pub unsafe fn from_borrowed(
        ptr: *mut u8,
        len: usize,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        format: PixelFormat,
        release: Option<ReleaseHook>,
    ) -> Result<Self> {
        if ptr.is_null() {
            return Err(ImagingError::InvalidArgument(
                "borrowed frame pointer is null".to_string(),
            ));
        }
        let expected = height as usize * width as usize * bytes_per_pixel as usize;
        if len != expected {
            return Err(ImagingError::InvalidSize(format!(
                "payload is {len} bytes but geometry implies {expected}"
            )));
        }

        Ok(Self {
            id: 0,
            timestamp_ns: now_ns(),
            width,
            height,
            bytes_per_pixel,
            format,
            data: FrameData::Borrowed {
                ptr,
                len,
                release,
            },
            lock: LockState::Unlocked,
            metadata: FrameMetadata::default(),
        })
    }

    /// Wrap a payload that lives inside a shared-memory region slot.
    ///
    /// The frame holds a strong reference to the region, pinning the mapping
    /// for its own lifetime. The byte range must lie wholly inside the
    /// region's slot area.
    pub fn from_mapped(
        region: Arc<SharedMemoryRegion>,
        offset: usize,
        len: usize,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        format: PixelFormat,
    ) -> Result<Self> {
        if offset < region.data_offset()
            || offset.checked_add(len).map_or(true, |end| end > region.size())
        {
            return Err(ImagingError::InvalidArgument(format!(
                "mapped range [{offset}, {offset}+{len}) is outside the slot area",
            )));
        }

        Ok(Self {
            id: 0,
            timestamp_ns: now_ns(),
            width,
            height,
            bytes_per_pixel,
            format,
            data: FrameData::Mapped {
                region,
                offset,
                len,
            },
            lock: LockState::Unlocked,
            metadata: FrameMetadata::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Capture timestamp, nanoseconds since the Unix epoch.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn kind(&self) -> FrameDataKind {
        match &self.data {
            FrameData::Owned(_) => FrameDataKind::Owned,
            FrameData::Borrowed { .. } => FrameDataKind::Borrowed,
            FrameData::Mapped { .. } => FrameDataKind::Mapped,
            FrameData::Gpu => FrameDataKind::Gpu,
            FrameData::Dma => FrameDataKind::Dma,
        }
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        match &self.data {
            FrameData::Owned(buf) => buf.len(),
            FrameData::Borrowed { len, .. } => *len,
            FrameData::Mapped { len, .. } => *len,
            FrameData::Gpu | FrameData::Dma => 0,
        }
    }

    /// Raw payload bytes.
    ///
    /// For mapped frames the pointer is resolved through the region on every
    /// call, so the frame sees the correct address even if the region were
    /// to relocate its mapping.
    pub fn data(&self) -> Result<&[u8]> {
        match &self.data {
            FrameData::Owned(buf) => Ok(buf.as_slice()),
            FrameData::Borrowed { ptr, len, .. } => {
                // SAFETY: constructor contract guarantees `ptr`/`len` valid
                // until the release hook runs at drop.
                Ok(unsafe { std::slice::from_raw_parts(*ptr, *len) })
            }
            FrameData::Mapped {
                region,
                offset,
                len,
            } => region.bytes_at(*offset, *len),
            FrameData::Gpu => Err(ImagingError::NotSupported(
                "GPU frame data access".to_string(),
            )),
            FrameData::Dma => Err(ImagingError::NotSupported(
                "DMA frame data access".to_string(),
            )),
        }
    }

    /// Mutable payload access for CPU-resident frames.
    ///
    /// Only Owned and Borrowed payloads can be mutated; a Mapped frame is
    /// immutable after publish and device-resident kinds have no host
    /// mapping.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.data {
            FrameData::Owned(buf) => Ok(buf.as_mut_slice()),
            FrameData::Borrowed { ptr, len, .. } => {
                // SAFETY: constructor contract guarantees `ptr`/`len` valid
                // until the release hook runs at drop; &mut self gives
                // exclusive access.
                Ok(unsafe { std::slice::from_raw_parts_mut(*ptr, *len) })
            }
            FrameData::Mapped { .. } => Err(ImagingError::NotSupported(
                "mapped frames are immutable after publish".to_string(),
            )),
            FrameData::Gpu | FrameData::Dma => Err(ImagingError::NotSupported(
                "device-resident frame data access".to_string(),
            )),
        }
    }

    /// The region and payload offset of a mapped frame, if it is one.
    pub fn mapped_location(&self) -> Option<(&Arc<SharedMemoryRegion>, usize)> {
        match &self.data {
            FrameData::Mapped { region, offset, .. } => Some((region, *offset)),
            _ => None,
        }
    }

    /// Lock the payload for access.
    ///
    /// Locking is idempotent for CPU-resident kinds and is not reference
    /// counted: one [`unlock`](Self::unlock) clears any number of locks.
    /// Requesting a read lock while a write lock is held is an error; a
    /// write request while read-locked upgrades the lock.
    pub fn lock(&mut self, read_only: bool) -> Result<()> {
        match self.data {
            FrameData::Gpu | FrameData::Dma => {
                return Err(ImagingError::NotSupported(
                    "lock on device-resident frame".to_string(),
                ))
            }
            _ => {}
        }

        if read_only && self.lock == LockState::Write {
            return Err(ImagingError::InvalidArgument(
                "read lock requested while write lock is held".to_string(),
            ));
        }

        self.lock = if read_only {
            LockState::Read
        } else {
            LockState::Write
        };
        Ok(())
    }

    /// Release the payload lock. Safe to call when not locked.
    pub fn unlock(&mut self) {
        self.lock = LockState::Unlocked;
    }

    pub fn is_locked(&self) -> bool {
        self.lock != LockState::Unlocked
    }

    /// Byte-for-byte copy of payload and metadata into a new frame of the
    /// requested kind. Only `Owned` targets can be produced without a
    /// destination slot; use [`clone_into_slot`](Self::clone_into_slot) for
    /// mapped targets.
    pub fn clone_into(&self, kind: FrameDataKind) -> Result<Frame> {
        match kind {
            FrameDataKind::Owned => {
                let payload = self.data()?;
                let mut copy =
                    Frame::new(self.width, self.height, self.bytes_per_pixel, self.format)?;
                match &mut copy.data {
                    // Assign rather than copy_from_slice: a mapped source
                    // may carry stride padding beyond width * bpp.
                    FrameData::Owned(buf) => *buf = payload.to_vec(),
                    _ => unreachable!("Frame::new always produces owned payloads"),
                }
                copy.id = self.id;
                copy.timestamp_ns = self.timestamp_ns;
                copy.metadata = self.metadata.clone();
                Ok(copy)
            }
            other => Err(ImagingError::NotSupported(format!(
                "clone into {other:?} frame"
            ))),
        }
    }

    /// Copy this frame's payload into a region at `payload_offset` and
    /// return a mapped frame over the copy.
    pub fn clone_into_slot(
        &self,
        region: &Arc<SharedMemoryRegion>,
        payload_offset: usize,
    ) -> Result<Frame> {
        let payload = self.data()?;
        region.write_bytes(payload_offset, payload)?;
        let mut copy = Frame::from_mapped(
            Arc::clone(region),
            payload_offset,
            payload.len(),
            self.width,
            self.height,
            self.bytes_per_pixel,
            self.format,
        )?;
        copy.id = self.id;
        copy.timestamp_ns = self.timestamp_ns;
        copy.metadata = self.metadata.clone();
        Ok(copy)
    }

    /// Set a free-form attribute on the frame.
    pub fn set_attribute(&mut self, key: &str, value: &str) {
        self.metadata
            .attributes
            .insert(key.to_string(), value.to_string());
    }

    /// Look up a free-form attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.metadata.attributes.get(key).map(String::as_str)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let FrameData::Borrowed { release, .. } = &mut self.data {
            if let Some(hook) = release.take() {
                // A failing hook must never escape a destructor; it is
                // logged and swallowed.
                if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                    error!("frame release hook panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_pixel", &self.bytes_per_pixel)
            .field("format", &self.format)
            .field("kind", &self.kind())
            .field("data_size", &self.data_size())
            .finish()
    }
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_owned_frame_allocation() {
        let frame = Frame::new(4, 2, 2, PixelFormat::Yuv).unwrap();
        assert_eq!(frame.data_size(), 16);
        assert_eq!(frame.kind(), FrameDataKind::Owned);
        assert!(frame.data().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_borrowed_release_hook_runs_exactly_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut buf = vec![7u8; 16];
        let released_clone = Arc::clone(&released);

        let frame = unsafe {
            Frame::from_borrowed(
                buf.as_mut_ptr(),
                buf.len(),
                4,
                2,
                2,
                PixelFormat::Yuv,
                Some(Box::new(move || {
                    released_clone.fetch_add(1, Ordering::SeqCst);
                })),
            )
        }
        .unwrap();

        assert_eq!(frame.data().unwrap(), &buf[..]);
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_hook_runs_during_unwind() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut buf = vec![0u8; 4];
        let released_clone = Arc::clone(&released);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _frame = unsafe {
                Frame::from_borrowed(
                    buf.as_mut_ptr(),
                    buf.len(),
                    1,
                    2,
                    2,
                    PixelFormat::Yuv,
                    Some(Box::new(move || {
                        released_clone.fetch_add(1, Ordering::SeqCst);
                    })),
                )
            }
            .unwrap();
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let mut buf = vec![0u8; 4];
        let frame = unsafe {
            Frame::from_borrowed(
                buf.as_mut_ptr(),
                buf.len(),
                1,
                2,
                2,
                PixelFormat::Yuv,
                Some(Box::new(|| panic!("hook failure"))),
            )
        }
        .unwrap();
        // Dropping must not propagate the hook panic.
        drop(frame);
    }

    #[test]
    fn test_borrowed_rejects_geometry_mismatch() {
        let mut buf = vec![0u8; 10];
        let result = unsafe {
            Frame::from_borrowed(buf.as_mut_ptr(), buf.len(), 4, 2, 2, PixelFormat::Yuv, None)
        };
        assert!(matches!(result, Err(ImagingError::InvalidSize(_))));
    }

    #[test]
    fn test_lock_is_idempotent_and_single_unlock_clears() {
        let mut frame = Frame::new(2, 2, 2, PixelFormat::Yuv).unwrap();
        frame.lock(true).unwrap();
        frame.lock(true).unwrap();
        frame.lock(true).unwrap();
        assert!(frame.is_locked());
        frame.unlock();
        assert!(!frame.is_locked());
    }

    #[test]
    fn test_read_lock_while_write_locked_fails() {
        let mut frame = Frame::new(2, 2, 2, PixelFormat::Yuv).unwrap();
        frame.lock(false).unwrap();
        assert!(matches!(
            frame.lock(true),
            Err(ImagingError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_clone_into_owned_copies_payload_and_metadata() {
        let mut frame = Frame::new(2, 2, 2, PixelFormat::Bgra).unwrap();
        frame.set_id(99);
        frame.metadata.device_id = "dev1".to_string();
        frame.set_attribute("timecode", "00:00:01:00");

        let copy = frame.clone_into(FrameDataKind::Owned).unwrap();
        assert_eq!(copy.id(), 99);
        assert_eq!(copy.metadata.device_id, "dev1");
        assert_eq!(copy.attribute("timecode"), Some("00:00:01:00"));
        assert_eq!(copy.data().unwrap(), frame.data().unwrap());
    }

    #[test]
    fn test_clone_into_unsupported_kinds() {
        let frame = Frame::new(2, 2, 2, PixelFormat::Yuv).unwrap();
        assert!(frame.clone_into(FrameDataKind::Gpu).is_err());
        assert!(frame.clone_into(FrameDataKind::Dma).is_err());
        assert!(frame.clone_into(FrameDataKind::Borrowed).is_err());
    }

    #[test]
    fn test_format_code_round_trip() {
        for format in [
            PixelFormat::Yuv,
            PixelFormat::Bgra,
            PixelFormat::Yuv10,
            PixelFormat::Rgb10,
            PixelFormat::Unknown,
        ] {
            assert_eq!(PixelFormat::from_code(format.code()), format);
        }
        assert_eq!(PixelFormat::from_code(0xDEAD), PixelFormat::Unknown);
    }

    #[test]
    fn test_format_name_parsing() {
        assert_eq!(PixelFormat::from_name("YUV422"), PixelFormat::Yuv);
        assert_eq!(PixelFormat::from_name("RGBA"), PixelFormat::Bgra);
        assert_eq!(PixelFormat::from_name("YUV422_10"), PixelFormat::Yuv10);
        assert_eq!(PixelFormat::from_name("RGB10"), PixelFormat::Rgb10);
        assert_eq!(PixelFormat::from_name("v210"), PixelFormat::Unknown);
    }
}
