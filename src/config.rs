//! Configuration structures for the service, the shared-memory transport and
//! the capture source.
//!
//! All configs are plain data with serde derives so they round-trip through
//! the diagnostics JSON dump. They arrive programmatically, from CLI flags or
//! through the C ABI; there is no settings-file layer.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ImagingError, Result};
use crate::frame::PixelFormat;

/// OS mechanism providing the byte range for a shared-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingKind {
    /// Named POSIX shared memory (`shm_open`); names are forced to a
    /// leading `/`.
    PosixShm,
    /// System V shared memory; the region name is a filesystem path used
    /// for `ftok` keying.
    SysvShm,
    /// A plain file of exactly `size` bytes, default under `/dev/shm`.
    /// The file persists on disk after the producer exits.
    MappedFile,
    /// hugetlbfs-backed file; `size` is rounded up to the huge-page size
    /// reported by the OS.
    HugePages,
}

impl BackingKind {
    /// Numeric code used by the `--shared-memory-type` CLI flag and the
    /// C ABI config struct.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(BackingKind::PosixShm),
            1 => Ok(BackingKind::SysvShm),
            2 => Ok(BackingKind::MappedFile),
            3 => Ok(BackingKind::HugePages),
            other => Err(ImagingError::InvalidArgument(format!(
                "unknown shared memory type code {other}"
            ))),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            BackingKind::PosixShm => 0,
            BackingKind::SysvShm => 1,
            BackingKind::MappedFile => 2,
            BackingKind::HugePages => 3,
        }
    }
}

/// Which side of the transport this process plays for a given region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionRole {
    /// Creates and owns the region; exclusive writer of the control block
    /// and the slot array.
    Producer,
    /// Maps an existing region read-mostly; callback consumers additionally
    /// publish the advisory `read_index`.
    Consumer,
}

/// Configuration of a shared-memory region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMemoryConfig {
    /// Region name. Interpretation depends on the backing kind.
    pub name: String,
    /// Total region size in bytes (rounded up to a huge-page multiple for
    /// `HugePages`).
    pub size: usize,
    pub backing: BackingKind,
    pub role: RegionRole,
    /// Advisory frame-count hint; the authoritative count is derived from
    /// `size` and `max_frame_size` at creation.
    pub max_frames: usize,
    /// Mandatory upper bound on a single frame payload.
    pub max_frame_size: usize,
    /// Attempt to `mlock` the mapping. Failure is non-fatal and is reported
    /// in statistics.
    pub lock_in_ram: bool,
    /// When the ring is full: drop (count and report `BufferFull`) instead
    /// of waiting.
    pub drop_frames_when_full: bool,
    /// Write the region-level JSON metadata document and the `last_frame`
    /// object on every publish.
    pub enable_metadata: bool,
    /// Backing file path for `MappedFile` / `SysvShm`; defaults to
    /// `/dev/shm/<name>`.
    pub file_path: Option<PathBuf>,
    /// Request realtime scheduling for transport-adjacent threads.
    pub realtime_threads: bool,
    /// Bounded wait in milliseconds for the cooperative (non-dropping)
    /// producer write path.
    pub write_timeout_ms: u64,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            name: "imaging_frames".to_string(),
            size: 64 * 1024 * 1024,
            backing: BackingKind::PosixShm,
            role: RegionRole::Producer,
            max_frames: 0,
            max_frame_size: 1920 * 1080 * 2,
            lock_in_ram: true,
            drop_frames_when_full: true,
            enable_metadata: true,
            file_path: None,
            realtime_threads: false,
            write_timeout_ms: 100,
        }
    }
}

/// Preferred placement of frame payload memory on the capture side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferPreference {
    /// Plain host memory.
    Cpu,
    /// Vendor DMA buffers delivered as borrowed frames.
    Dma,
    /// GPU-resident buffers (declared, not implemented).
    GpuDirect,
}

/// Externally supplied allocation hooks for capture buffers.
///
/// Carried as opaque callables; not serializable and not printable beyond
/// their presence.
#[derive(Clone)]
pub struct ExternalAllocator {
    pub alloc: Arc<dyn Fn(usize) -> *mut u8 + Send + Sync>,
    pub free: Arc<dyn Fn(*mut u8, usize) + Send + Sync>,
}

impl fmt::Debug for ExternalAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalAllocator { .. }")
    }
}

/// Configuration for a capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub pixel_format: PixelFormat,
    /// Audio, when enabled, is delivered alongside video by the vendor but
    /// never reaches the ring.
    pub enable_audio: bool,
    pub enable_dma: bool,
    pub enable_gpu_direct: bool,
    pub preferred_buffer_kind: BufferPreference,
    /// Name of a shared-memory region the source should write into directly,
    /// for sources that support `set_direct_output`.
    pub direct_output_region: Option<String>,
    /// Number of delivery buffers the source keeps in flight.
    pub buffer_count: usize,
    pub hardware_timestamps: bool,
    #[serde(skip)]
    pub external_allocator: Option<ExternalAllocator>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 60.0,
            pixel_format: PixelFormat::Yuv,
            enable_audio: false,
            enable_dma: true,
            enable_gpu_direct: false,
            preferred_buffer_kind: BufferPreference::Cpu,
            direct_output_region: None,
            buffer_count: 4,
            hardware_timestamps: false,
            external_allocator: None,
        }
    }
}

impl CaptureConfig {
    /// Payload size of one frame under this configuration.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel() as usize
    }
}

/// Top-level acquisition service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Device to bind; `None` selects the first available device.
    pub device_id: Option<String>,
    pub capture: CaptureConfig,
    pub enable_shared_memory: bool,
    pub shared_memory: SharedMemoryConfig,
    /// Capacity of the internal most-recent-frames ring used by
    /// non-shared-memory consumers and diagnostics.
    pub frame_buffer_size: usize,
    pub enable_monitoring: bool,
    /// Emit the periodic monitor summary line.
    pub enable_logging: bool,
    /// Interval between monitor summary lines.
    pub log_interval: Duration,
    /// CPU for the monitor thread; negative leaves affinity untouched.
    pub thread_affinity: i32,
    /// Run the monitor under `SCHED_RR`.
    pub realtime_priority: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            capture: CaptureConfig::default(),
            enable_shared_memory: true,
            shared_memory: SharedMemoryConfig::default(),
            frame_buffer_size: 120,
            enable_monitoring: true,
            enable_logging: false,
            log_interval: Duration::from_millis(1000),
            thread_affinity: -1,
            realtime_priority: true,
        }
    }
}

impl ServiceConfig {
    /// Semantic validation beyond what parsing can catch.
    pub fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ImagingError::Configuration(
                "capture dimensions must be non-zero".to_string(),
            ));
        }
        if self.capture.frame_rate <= 0.0 {
            return Err(ImagingError::Configuration(
                "frame rate must be positive".to_string(),
            ));
        }
        if self.frame_buffer_size == 0 {
            return Err(ImagingError::Configuration(
                "frame buffer size must be at least 1".to_string(),
            ));
        }
        if self.enable_shared_memory && self.shared_memory.max_frame_size == 0 {
            return Err(ImagingError::Configuration(
                "max_frame_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

}
