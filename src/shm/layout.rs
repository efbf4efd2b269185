//! Bit-exact on-memory layout of a shared-memory region.
//!
//! The region is four contiguous areas, in this order:
//!
//! ```text
//! 0x0000  ControlBlock (256 B, cache-line aligned)
//! 0x0100  Metadata JSON (UTF-8, NUL-terminated, 4 KiB default)
//! 0x1100  Slot 0: FrameHeader (80 B) + payload (max_frame_size)
//! ...     Slot i at 0x1100 + i * slot_size
//! ```
//!
//! All multi-byte fields are little-endian; the layout assumes LP64. The
//! structures use `#[repr(C)]` so that consumers written in other languages
//! can overlay the same definitions, and their sizes are pinned by
//! compile-time assertions in the manner of cross-language headers.
//!
//! The JSON metadata is advisory: the binary control block and the slot
//! headers are authoritative, and a corrupt or missing metadata area must
//! not prevent consumers from operating.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8};

use serde::{Deserialize, Serialize};

use crate::frame::FrameMetadata;

/// Size of the control block area.
pub const CONTROL_BLOCK_SIZE: usize = 256;

/// Offset of the metadata JSON area.
pub const METADATA_OFFSET: usize = 0x100;

/// Default size of the metadata JSON area.
pub const METADATA_SIZE: usize = 0x1000;

/// Offset of slot 0.
pub const DATA_OFFSET: usize = METADATA_OFFSET + METADATA_SIZE;

/// Size of one slot header.
pub const FRAME_HEADER_SIZE: usize = 80;

/// Slots are aligned to cache-line multiples.
pub const SLOT_ALIGN: usize = 64;

/// Header flag bit 0: the payload was republished zero-copy from a slot of
/// this same region.
pub const FRAME_FLAG_ZERO_COPY: u32 = 1;

/// Region `type` tag written into the metadata document.
pub const REGION_TYPE: &str = "medical_imaging_frames";

/// Metadata document format version.
pub const METADATA_FORMAT_VERSION: &str = "1.0";

/// Payload estimate used only when a consumer cannot recover the slot
/// geometry from the metadata JSON: 1080p at 2 bytes per pixel.
pub const FALLBACK_FRAME_SIZE: usize = 1920 * 1080 * 2;

/// The atomic control block at offset 0.
///
/// The producer is the exclusive mutator with one exception: callback
/// consumers publish the advisory `read_index` (and the read-side
/// informational counters). `write_index` is the single ordering authority
/// for slot visibility; everything else is informational and uses relaxed
/// ordering.
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Next slot to be written; its release store is the publication point.
    pub write_index: AtomicU64, // 0x00
    /// Advisory oldest-valid-frame index, producer-owned. Callback readers
    /// update it as a courtesy so the producer can observe backpressure;
    /// pull readers may ignore it.
    pub read_index: AtomicU64, // 0x08
    /// Informational in-flight frame count.
    pub frame_count: AtomicU64, // 0x10
    /// Write attempts (successful publishes plus drops).
    pub total_written: AtomicU64, // 0x18
    /// Frames consumed through cursor readers.
    pub total_read: AtomicU64, // 0x20
    /// Frames dropped under buffer pressure.
    pub dropped: AtomicU64, // 0x28
    /// Non-zero once the producer has finished initializing the region.
    pub active: AtomicU8, // 0x30
    _pad0: [u8; 7], // 0x31
    pub last_write_time_ns: AtomicU64, // 0x38
    pub last_read_time_ns: AtomicU64,  // 0x40
    /// Offset of the metadata JSON area (always `0x100`).
    pub metadata_offset: u32, // 0x48
    /// Size of the metadata JSON area (always `0x1000`).
    pub metadata_size: u32, // 0x4C
    pub flags: AtomicU32, // 0x50
    _pad1: [u8; 172], // 0x54 .. 0x100
}

const _: () = assert!(
    std::mem::size_of::<ControlBlock>() == CONTROL_BLOCK_SIZE,
    "ControlBlock must be exactly 256 bytes"
);

/// Per-slot header preceding the payload bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub frame_id: u64,        // 0x00
    pub timestamp_ns: u64,    // 0x08
    pub width: u32,           // 0x10
    pub height: u32,          // 0x14
    pub bytes_per_pixel: u32, // 0x18
    pub data_size: u32,       // 0x1C
    pub format_code: u32,     // 0x20
    /// Bit 0 = zero-copy republish.
    pub flags: u32, // 0x24
    /// Absolute ring index at which the slot was written.
    pub sequence_number: u64, // 0x28
    /// Optional per-frame metadata location; zero when unused.
    pub metadata_offset: u32, // 0x30
    pub metadata_size: u32,   // 0x34
    pub reserved: [u64; 3],   // 0x38 .. 0x50
}

const _: () = assert!(
    std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE,
    "FrameHeader must be exactly 80 bytes"
);

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Size of one slot for a given payload bound.
pub const fn slot_size(max_frame_size: usize) -> usize {
    align_up(FRAME_HEADER_SIZE + max_frame_size, SLOT_ALIGN)
}

/// Number of slots a region of `region_size` bytes can hold.
pub fn max_frames(region_size: usize, slot_size: usize) -> u64 {
    if region_size <= DATA_OFFSET {
        return 0;
    }
    ((region_size - DATA_OFFSET) / slot_size) as u64
}

/// Offset of the slot for absolute ring index `index`.
pub fn slot_offset(index: u64, max_frames: u64, slot_size: usize) -> usize {
    DATA_OFFSET + (index % max_frames) as usize * slot_size
}

/// The `last_frame` object embedded in the region metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastFrameMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub timestamp: u64,
    pub id: u64,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub metadata: FrameMetadata,
}

/// Region-level metadata document stored as NUL-terminated UTF-8 JSON at
/// [`METADATA_OFFSET`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMetadata {
    pub format_version: String,
    pub created_at: u64,
    #[serde(rename = "type")]
    pub region_type: String,
    pub max_frames: u64,
    pub buffer_size: u64,
    pub data_offset: u64,
    pub frame_slot_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub using_huge_pages: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub huge_page_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame: Option<LastFrameMetadata>,
}
