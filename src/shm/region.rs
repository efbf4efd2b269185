//! Named shared-memory regions.
//!
//! A [`SharedMemoryRegion`] is a named, memory-mapped byte range laid out as
//! described in [`layout`](super::layout): control block, metadata JSON,
//! slot array. Four OS backings are supported (POSIX shm, System V shm,
//! plain mapped file, hugetlbfs). The producer creates and initializes the
//! region; any number of consumers map it read-mostly.
//!
//! # Lifecycle
//!
//! The producer constructs the control block in place and stores
//! `active = 1` with release ordering as the very last step of
//! initialization; consumers poll that flag with acquire ordering for up to
//! one second before giving up. On drop the producer deactivates the region
//! and unlinks the backing name (POSIX / huge pages) or removes the segment
//! (System V); plain files persist on disk. A mapped [`Frame`](crate::Frame)
//! holds an `Arc` to its region, so an outstanding frame pins the mapping
//! until it drops.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapRaw;
use tracing::{debug, info, warn};

use super::layout::{
    max_frames, slot_size, ControlBlock, FrameHeader, RegionMetadata, DATA_OFFSET,
    FALLBACK_FRAME_SIZE, FRAME_HEADER_SIZE, METADATA_FORMAT_VERSION, METADATA_OFFSET,
    METADATA_SIZE, REGION_TYPE,
};
use crate::config::{BackingKind, RegionRole, SharedMemoryConfig};
use crate::error::{ImagingError, Result};

/// How long a consumer waits for the producer's `active` handshake.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll granularity of the attach handshake.
const ATTACH_POLL: Duration = Duration::from_millis(10);

/// Default directory for file-backed regions.
const DEFAULT_FILE_DIR: &str = "/dev/shm";
/// Mount point used for huge-page backed regions.
const HUGETLBFS_DIR: &str = "/dev/hugepages";

enum Mapping {
    Mmap(MmapRaw),
    Sysv { addr: *mut u8 },
}

impl Mapping {
    fn ptr(&self) -> *mut u8 {
        match self {
            Mapping::Mmap(map) => map.as_mut_ptr(),
            Mapping::Sysv { addr, .. } => *addr,
        }
    }
}

enum BackingHandle {
    Posix { shm_name: CString },
    Sysv { shmid: i32 },
    File { path: PathBuf },
    Huge { path: PathBuf },
}

/// A mapped shared-memory region. See the module docs for the lifecycle.
pub struct SharedMemoryRegion {
    name: String,
    role: RegionRole,
    backing: BackingHandle,
    mapping: Mapping,
    size: usize,
    slot_size: usize,
    max_frames: u64,
    data_offset: usize,
    huge_page_size: Option<u64>,
    mlock_failed: bool,
    drop_frames_when_full: bool,
    enable_metadata: bool,
    realtime_threads: bool,
    write_timeout_ms: u64,
}

// SAFETY: the mapping pointer is valid for the lifetime of the struct and
// all mutation of shared state goes through the atomics of the control
// block or through offset-checked raw copies whose synchronization is the
// ring protocol's publication ordering.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

/// Counter snapshot of a region's control block.
#[derive(Debug, Clone, Default)]
pub struct RegionStats {
    pub write_index: u64,
    pub read_index: u64,
    pub frame_count: u64,
    pub total_written: u64,
    pub total_read: u64,
    pub dropped: u64,
    pub active: bool,
    pub mlock_failed: bool,
}

impl SharedMemoryRegion {
    /// Create and initialize a region as the producer.
    pub fn create(config: &SharedMemoryConfig) -> Result<Arc<Self>> {
        if config.max_frame_size == 0 {
            return Err(ImagingError::InvalidSize(
                "max_frame_size must allow at least one payload byte".to_string(),
            ));
        }

        let slot = slot_size(config.max_frame_size);
        let mut size = config.size;
        let mut huge_page = None;

        if config.backing == BackingKind::HugePages {
            let page = huge_page_bytes();
            size = super::layout::align_up(size, page as usize);
            huge_page = Some(page);
        }

        let frames = max_frames(size, slot);
        if frames < 1 {
            return Err(ImagingError::InvalidSize(format!(
                "region of {size} bytes cannot hold one {slot}-byte slot after the {DATA_OFFSET}-byte layout prefix"
            )));
        }

        let (mapping, backing) = map_backing(config, size, true)?;
        let ptr = mapping.ptr();

        let mut mlock_failed = false;
        if config.lock_in_ram {
            // SAFETY: ptr/size describe the mapping we just created.
            let rc = unsafe { libc::mlock(ptr as *const libc::c_void, size) };
            if rc != 0 {
                warn!(
                    name = %config.name,
                    error = %std::io::Error::last_os_error(),
                    "mlock failed; region stays pageable"
                );
                mlock_failed = true;
            }
        }

        // SAFETY: the mapping is at least DATA_OFFSET bytes (frames >= 1
        // implies size > DATA_OFFSET); zero the control block and metadata
        // area before constructing the control block in place.
        unsafe {
            std::ptr::write_bytes(ptr, 0, DATA_OFFSET);
            (ptr.add(0x48) as *mut u32).write(METADATA_OFFSET as u32);
            (ptr.add(0x4C) as *mut u32).write(METADATA_SIZE as u32);
        }

        let region = Self {
            name: config.name.clone(),
            role: RegionRole::Producer,
            backing,
            mapping,
            size,
            slot_size: slot,
            max_frames: frames,
            data_offset: DATA_OFFSET,
            huge_page_size: huge_page,
            mlock_failed,
            drop_frames_when_full: config.drop_frames_when_full,
            enable_metadata: config.enable_metadata,
            realtime_threads: config.realtime_threads,
            write_timeout_ms: config.write_timeout_ms,
        };

        if region.enable_metadata {
            region.write_region_metadata(&region.base_metadata())?;
        }

        // Publication point of the whole region: consumers spin on this.
        region.control().active.store(1, Ordering::Release);

        info!(
            name = %region.name,
            size,
            slot_size = slot,
            max_frames = frames,
            backing = ?config.backing,
            "shared memory region created"
        );
        Ok(Arc::new(region))
    }

    /// Map an existing region as a consumer.
    ///
    /// Waits up to one second for the producer's `active` handshake, then
    /// recovers the slot geometry from the metadata JSON, falling back to
    /// the 1080p estimate when the document is unreadable.
    pub fn open(config: &SharedMemoryConfig) -> Result<Arc<Self>> {
        let (mapping, backing, size) = open_backing(config)?;
        let ptr = mapping.ptr();

        // SAFETY: every backing kind maps at least one slot header past the
        // layout prefix or we bail below; validate before touching the
        // control block.
        if size < DATA_OFFSET + FRAME_HEADER_SIZE {
            return Err(ImagingError::InvalidSize(format!(
                "existing region is only {size} bytes"
            )));
        }

        let control = unsafe { &*(ptr as *const ControlBlock) };
        let mut waited = Duration::ZERO;
        while control.active.load(Ordering::Acquire) == 0 {
            if waited >= ATTACH_TIMEOUT {
                return Err(ImagingError::Internal(format!(
                    "timed out waiting for producer to activate region '{}'",
                    config.name
                )));
            }
            std::thread::sleep(ATTACH_POLL);
            waited += ATTACH_POLL;
        }

        let mut region = Self {
            name: config.name.clone(),
            role: RegionRole::Consumer,
            backing,
            mapping,
            size,
            slot_size: 0,
            max_frames: 0,
            data_offset: DATA_OFFSET,
            huge_page_size: None,
            mlock_failed: false,
            drop_frames_when_full: config.drop_frames_when_full,
            enable_metadata: config.enable_metadata,
            realtime_threads: config.realtime_threads,
            write_timeout_ms: config.write_timeout_ms,
        };

        // The JSON document is advisory; only geometry that actually fits
        // the mapped size is accepted, anything else falls back to the
        // producer's default estimate.
        let recovered = region.read_region_metadata().filter(|meta| {
            meta.frame_slot_size >= FRAME_HEADER_SIZE as u64
                && meta.max_frames > 0
                && meta.data_offset >= DATA_OFFSET as u64
                && meta
                    .data_offset
                    .checked_add(meta.max_frames.saturating_mul(meta.frame_slot_size))
                    .map_or(false, |end| end <= size as u64)
        });
        match recovered {
            Some(meta) => {
                region.slot_size = meta.frame_slot_size as usize;
                region.max_frames = meta.max_frames;
                region.data_offset = meta.data_offset as usize;
                region.huge_page_size = meta.huge_page_size;
            }
            None => {
                let slot = slot_size(FALLBACK_FRAME_SIZE).min(size - DATA_OFFSET);
                region.slot_size = slot;
                region.max_frames = max_frames(size, slot).max(1);
                debug!(
                    name = %region.name,
                    "region metadata unreadable; using 1080p slot estimate"
                );
            }
        }

        info!(
            name = %region.name,
            size,
            slot_size = region.slot_size,
            max_frames = region.max_frames,
            "attached to shared memory region"
        );
        Ok(Arc::new(region))
    }

    pub(crate) fn base_metadata(&self) -> RegionMetadata {
        RegionMetadata {
            format_version: METADATA_FORMAT_VERSION.to_string(),
            created_at: chrono::Utc::now().timestamp() as u64,
            region_type: REGION_TYPE.to_string(),
            max_frames: self.max_frames,
            buffer_size: self.size as u64,
            data_offset: self.data_offset as u64,
            frame_slot_size: self.slot_size as u64,
            using_huge_pages: self.huge_page_size.map(|_| true),
            huge_page_size: self.huge_page_size,
            last_frame: None,
        }
    }

    /// The control block at offset 0.
    pub fn control(&self) -> &ControlBlock {
        // SAFETY: the mapping is page-aligned and at least DATA_OFFSET
        // bytes; ControlBlock is repr(C, align(64)).
        unsafe { &*(self.mapping.ptr() as *const ControlBlock) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> RegionRole {
        self.role
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn max_frames(&self) -> u64 {
        self.max_frames
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn mlock_failed(&self) -> bool {
        self.mlock_failed
    }

    pub fn drop_frames_when_full(&self) -> bool {
        self.drop_frames_when_full
    }

    pub fn metadata_enabled(&self) -> bool {
        self.enable_metadata
    }

    pub fn realtime_threads(&self) -> bool {
        self.realtime_threads
    }

    pub fn write_timeout_ms(&self) -> u64 {
        self.write_timeout_ms
    }

    pub fn is_active(&self) -> bool {
        self.control().active.load(Ordering::Acquire) != 0
    }

    /// Offset of the slot for absolute ring index `index`.
    pub fn slot_offset(&self, index: u64) -> usize {
        self.data_offset + (index % self.max_frames) as usize * self.slot_size
    }

    /// Offset of the payload bytes of the slot for `index`.
    pub fn payload_offset(&self, index: u64) -> usize {
        self.slot_offset(index) + FRAME_HEADER_SIZE
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// The returned slice aliases shared memory: its stability is governed
    /// by the ring protocol's overwrite horizon, not by the borrow checker.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| ImagingError::InvalidArgument("byte range overflows".to_string()))?;
        if end > self.size {
            return Err(ImagingError::ReadFailed(format!(
                "range [{offset}, {end}) exceeds region size {}",
                self.size
            )));
        }
        // SAFETY: bounds checked above; the mapping lives as long as self.
        Ok(unsafe { std::slice::from_raw_parts(self.mapping.ptr().add(offset), len) })
    }

    /// Copy `bytes` into the region at `offset` (slot area only).
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or_else(|| ImagingError::InvalidArgument("byte range overflows".to_string()))?;
        if offset < self.data_offset || end > self.size {
            return Err(ImagingError::WriteFailed(format!(
                "range [{offset}, {end}) is outside the slot area"
            )));
        }
        // SAFETY: bounds checked; source and destination cannot overlap
        // because `bytes` is process-local memory only when it does not
        // alias this mapping, and `copy` tolerates overlap otherwise.
        unsafe {
            std::ptr::copy(bytes.as_ptr(), self.mapping.ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Copy `len` bytes between two offsets of this region (overlap-safe).
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        for (offset, what) in [(src, "source"), (dst, "destination")] {
            let end = offset
                .checked_add(len)
                .ok_or_else(|| ImagingError::InvalidArgument("byte range overflows".to_string()))?;
            if offset < self.data_offset || end > self.size {
                return Err(ImagingError::WriteFailed(format!(
                    "{what} range [{offset}, {end}) is outside the slot area"
                )));
            }
        }
        // SAFETY: both ranges bounds-checked; ptr::copy allows overlap.
        unsafe {
            let base = self.mapping.ptr();
            std::ptr::copy(base.add(src), base.add(dst), len);
        }
        Ok(())
    }

    /// Read a copy of the header of the slot for `index`.
    pub fn header_at(&self, index: u64) -> FrameHeader {
        let offset = self.slot_offset(index);
        // SAFETY: slot_offset stays within the mapping by construction
        // (max_frames was derived from the region size).
        unsafe { (self.mapping.ptr().add(offset) as *const FrameHeader).read() }
    }

    /// Write the header of the slot for `index`.
    pub fn write_header(&self, index: u64, header: &FrameHeader) {
        let offset = self.slot_offset(index);
        // SAFETY: same bounds argument as header_at; the producer is the
        // only writer of slot headers.
        unsafe {
            (self.mapping.ptr().add(offset) as *mut FrameHeader).write(*header);
        }
    }

    /// Parse the metadata JSON document, if present and well-formed.
    pub fn read_region_metadata(&self) -> Option<RegionMetadata> {
        let control = self.control();
        let offset = control.metadata_offset as usize;
        let capacity = control.metadata_size as usize;
        if offset == 0 || capacity == 0 || offset + capacity > self.size {
            return None;
        }
        let raw = self.bytes_at(offset, capacity).ok()?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        if end == 0 {
            return None;
        }
        let text = std::str::from_utf8(&raw[..end]).ok()?;
        serde_json::from_str(text).ok()
    }

    /// Serialize and store the metadata JSON document.
    pub fn write_region_metadata(&self, metadata: &RegionMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| ImagingError::Internal(format!("metadata serialization failed: {e}")))?;
        let capacity = METADATA_SIZE;
        if json.len() + 1 > capacity {
            return Err(ImagingError::InvalidSize(format!(
                "metadata document of {} bytes exceeds the {capacity}-byte area",
                json.len()
            )));
        }
        // SAFETY: METADATA_OFFSET + METADATA_SIZE == DATA_OFFSET <= size.
        unsafe {
            let dst = self.mapping.ptr().add(METADATA_OFFSET);
            std::ptr::copy_nonoverlapping(json.as_ptr(), dst, json.len());
            dst.add(json.len()).write(0);
        }
        Ok(())
    }

    /// Snapshot of the control-block counters.
    pub fn stats(&self) -> RegionStats {
        let control = self.control();
        RegionStats {
            write_index: control.write_index.load(Ordering::Acquire),
            read_index: control.read_index.load(Ordering::Acquire),
            frame_count: control.frame_count.load(Ordering::Relaxed),
            total_written: control.total_written.load(Ordering::Relaxed),
            total_read: control.total_read.load(Ordering::Relaxed),
            dropped: control.dropped.load(Ordering::Relaxed),
            active: self.is_active(),
            mlock_failed: self.mlock_failed,
        }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if self.role == RegionRole::Producer {
            self.control().active.store(0, Ordering::Release);
        }

        if let Mapping::Sysv { addr } = self.mapping {
            // SAFETY: addr came from shmat and has not been detached.
            unsafe {
                libc::shmdt(addr as *const libc::c_void);
            }
        }

        if self.role == RegionRole::Producer {
            match &self.backing {
                BackingHandle::Posix { shm_name } => {
                    // SAFETY: shm_name is a valid NUL-terminated string.
                    unsafe {
                        libc::shm_unlink(shm_name.as_ptr());
                    }
                }
                BackingHandle::Huge { path } => {
                    let _ = std::fs::remove_file(path);
                }
                BackingHandle::Sysv { shmid } => {
                    // SAFETY: shmid came from shmget.
                    unsafe {
                        libc::shmctl(*shmid, libc::IPC_RMID, std::ptr::null_mut());
                    }
                }
                // File-backed regions persist until removed externally.
                BackingHandle::File { .. } => {}
            }
        }

        debug!(name = %self.name, role = ?self.role, "shared memory region released");
    }
}

/// POSIX shm names must carry exactly one leading slash.
fn posix_name(name: &str) -> Result<CString> {
    let normalized = format!("/{}", name.trim_start_matches('/'));
    CString::new(normalized)
        .map_err(|_| ImagingError::InvalidArgument("region name contains NUL".to_string()))
}

fn file_backing_path(config: &SharedMemoryConfig) -> PathBuf {
    config
        .file_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_DIR).join(&config.name))
}

fn map_backing(
    config: &SharedMemoryConfig,
    size: usize,
    create: bool,
) -> Result<(Mapping, BackingHandle)> {
    match config.backing {
        BackingKind::PosixShm => {
            let shm_name = posix_name(&config.name)?;
            let flags = if create {
                libc::O_CREAT | libc::O_RDWR
            } else {
                libc::O_RDWR
            };
            // SAFETY: shm_name is NUL-terminated.
            let fd = unsafe { libc::shm_open(shm_name.as_ptr(), flags, 0o600) };
            if fd < 0 {
                return Err(creation_error("shm_open", &config.name));
            }
            // SAFETY: fd is a freshly opened descriptor we own.
            let file = unsafe { std::fs::File::from_raw_fd(fd) };
            if create && file.set_len(size as u64).is_err() {
                // SAFETY: shm_name is NUL-terminated.
                unsafe {
                    libc::shm_unlink(shm_name.as_ptr());
                }
                return Err(creation_error("ftruncate", &config.name));
            }
            let map = MmapRaw::map_raw(&file)
                .map_err(|e| ImagingError::CreationFailed(format!("mmap failed: {e}")))?;
            Ok((Mapping::Mmap(map), BackingHandle::Posix { shm_name }))
        }
        BackingKind::MappedFile => {
            let path = file_backing_path(config);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&path)
                .map_err(|e| {
                    ImagingError::CreationFailed(format!("open {}: {e}", path.display()))
                })?;
            if create {
                file.set_len(size as u64).map_err(|e| {
                    ImagingError::CreationFailed(format!("resize {}: {e}", path.display()))
                })?;
            }
            let map = MmapRaw::map_raw(&file)
                .map_err(|e| ImagingError::CreationFailed(format!("mmap failed: {e}")))?;
            Ok((Mapping::Mmap(map), BackingHandle::File { path }))
        }
        BackingKind::HugePages => {
            let path = PathBuf::from(HUGETLBFS_DIR).join(&config.name);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&path)
                .map_err(|e| {
                    ImagingError::CreationFailed(format!("open {}: {e}", path.display()))
                })?;
            if create {
                file.set_len(size as u64).map_err(|e| {
                    ImagingError::CreationFailed(format!("resize {}: {e}", path.display()))
                })?;
            }
            let map = MmapRaw::map_raw(&file)
                .map_err(|e| ImagingError::CreationFailed(format!("mmap failed: {e}")))?;
            Ok((Mapping::Mmap(map), BackingHandle::Huge { path }))
        }
        BackingKind::SysvShm => {
            let path = file_backing_path(config);
            if create && !path.exists() {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|e| {
                        ImagingError::CreationFailed(format!(
                            "ftok key file {}: {e}",
                            path.display()
                        ))
                    })?;
            }
            let c_path = CString::new(path.as_os_str().to_string_lossy().into_owned())
                .map_err(|_| ImagingError::InvalidArgument("path contains NUL".to_string()))?;
            // SAFETY: c_path is NUL-terminated and points at an existing file.
            let key = unsafe { libc::ftok(c_path.as_ptr(), b'I' as libc::c_int) };
            if key == -1 {
                return Err(creation_error("ftok", &config.name));
            }
            let flags = if create {
                libc::IPC_CREAT | 0o600
            } else {
                0o600
            };
            // SAFETY: plain syscall with validated arguments.
            let shmid = unsafe { libc::shmget(key, size, flags) };
            if shmid < 0 {
                return Err(creation_error("shmget", &config.name));
            }
            // SAFETY: shmid is valid; the OS picks the attach address.
            let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
            if addr == usize::MAX as *mut libc::c_void {
                return Err(creation_error("shmat", &config.name));
            }
            Ok((
                Mapping::Sysv {
                    addr: addr as *mut u8,
                },
                BackingHandle::Sysv { shmid },
            ))
        }
    }
}

fn open_backing(config: &SharedMemoryConfig) -> Result<(Mapping, BackingHandle, usize)> {
    match config.backing {
        BackingKind::PosixShm | BackingKind::MappedFile | BackingKind::HugePages => {
            let size = existing_size(config)?;
            let (mapping, backing) = map_backing(config, size, false)?;
            Ok((mapping, backing, size))
        }
        BackingKind::SysvShm => {
            let path = file_backing_path(config);
            let c_path = CString::new(path.as_os_str().to_string_lossy().into_owned())
                .map_err(|_| ImagingError::InvalidArgument("path contains NUL".to_string()))?;
            // SAFETY: c_path is NUL-terminated.
            let key = unsafe { libc::ftok(c_path.as_ptr(), b'I' as libc::c_int) };
            if key == -1 {
                return Err(creation_error("ftok", &config.name));
            }
            // SAFETY: probe for an existing segment; size 0 means "any".
            let shmid = unsafe { libc::shmget(key, 0, 0o600) };
            if shmid < 0 {
                return Err(creation_error("shmget", &config.name));
            }
            let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
            // SAFETY: ds is a valid out-parameter.
            if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) } != 0 {
                return Err(creation_error("shmctl", &config.name));
            }
            let size = ds.shm_segsz as usize;
            // SAFETY: shmid validated above.
            let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
            if addr == usize::MAX as *mut libc::c_void {
                return Err(creation_error("shmat", &config.name));
            }
            Ok((
                Mapping::Sysv {
                    addr: addr as *mut u8,
                },
                BackingHandle::Sysv { shmid },
                size,
            ))
        }
    }
}

fn existing_size(config: &SharedMemoryConfig) -> Result<usize> {
    match config.backing {
        BackingKind::PosixShm => {
            let shm_name = posix_name(&config.name)?;
            // SAFETY: shm_name is NUL-terminated.
            let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDONLY, 0) };
            if fd < 0 {
                return Err(creation_error("shm_open", &config.name));
            }
            // SAFETY: fd is ours; fstat into a zeroed stat buffer.
            let size = unsafe {
                let mut st: libc::stat = std::mem::zeroed();
                let rc = libc::fstat(fd, &mut st);
                libc::close(fd);
                if rc != 0 {
                    return Err(creation_error("fstat", &config.name));
                }
                st.st_size as usize
            };
            Ok(size)
        }
        BackingKind::MappedFile => {
            let path = file_backing_path(config);
            Ok(std::fs::metadata(&path)
                .map_err(|e| {
                    ImagingError::CreationFailed(format!("stat {}: {e}", path.display()))
                })?
                .len() as usize)
        }
        BackingKind::HugePages => {
            let path = PathBuf::from(HUGETLBFS_DIR).join(&config.name);
            Ok(std::fs::metadata(&path)
                .map_err(|e| {
                    ImagingError::CreationFailed(format!("stat {}: {e}", path.display()))
                })?
                .len() as usize)
        }
        BackingKind::SysvShm => unreachable!("sysv size is read from shmctl"),
    }
}

fn creation_error(what: &str, name: &str) -> ImagingError {
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        ImagingError::PermissionDenied(format!("{what} for region '{name}': {err}"))
    } else {
        ImagingError::CreationFailed(format!("{what} for region '{name}': {err}"))
    }
}

/// Huge page size in bytes as reported by the OS, with a 2 MiB fallback.
fn huge_page_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("Hugepagesize:") {
                    if let Ok(kb) = rest.trim().trim_end_matches("kB").trim().parse::<u64>() {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    2 * 1024 * 1024
}
