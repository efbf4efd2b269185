//! C ABI for embedding the imaging service in non-Rust hosts.
//!
//! Services are addressed through opaque integer handles, never raw
//! pointers; every function answers a flat [`ImagingStatus`] code. All
//! structs crossing the boundary are `#[repr(C)]` PODs.
//!
//! # Pointer validity
//!
//! Frame data returned by [`imaging_service_get_latest_frame`] is staged in
//! a per-handle scratch buffer and stays valid only until the next call on
//! the same handle. Frames passed to a registered frame callback are valid
//! only for the duration of the callback, which runs on the producer
//! thread.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::warn;

use crate::capture::registry::DeviceRegistry;
use crate::config::{BackingKind, ServiceConfig};
use crate::error::ImagingError;
use crate::frame::PixelFormat;
use crate::service::registry::ServiceRegistry;
use crate::service::AcquisitionService;

/// Flat status codes of the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagingStatus {
    Ok = 0,
    InvalidArgument = 1,
    InvalidHandle = 2,
    DeviceError = 3,
    ProcessingError = 4,
    CommunicationError = 5,
    NotInitialized = 6,
    AlreadyRunning = 7,
    NotRunning = 8,
    InternalError = 9,
    NotImplemented = 10,
}

/// Opaque service handle. Zero is never a valid handle.
pub type ImagingServiceHandle = u64;

/// Frame record handed across the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImagingFrame {
    pub frame_id: u64,
    pub timestamp_ns: u64,
    pub width: i32,
    pub height: i32,
    pub bytes_per_pixel: i32,
    pub data_size: usize,
    pub data: *const u8,
    pub format: [c_char; 32],
}

/// Service configuration as seen from C. Null string pointers select the
/// documented defaults.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImagingServiceConfig {
    pub device_id: *const c_char,
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    pub pixel_format: *const c_char,
    pub enable_audio: c_int,
    pub enable_shared_memory: c_int,
    pub shared_memory_name: *const c_char,
    pub shared_memory_size: usize,
    /// 0 = POSIX shm, 1 = System V, 2 = mapped file, 3 = huge pages.
    pub shared_memory_type: c_int,
    pub max_frame_size: usize,
    pub frame_buffer_size: c_int,
    pub drop_frames_when_full: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImagingDeviceInfo {
    pub device_id: [c_char; 128],
    pub device_name: [c_char; 128],
    pub device_model: [c_char; 128],
    pub is_connected: c_int,
    pub is_capturing: c_int,
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    pub pixel_format: [c_char; 32],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImagingDeviceConfig {
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    pub pixel_format: [c_char; 32],
    pub supports_audio: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImagingStatistics {
    pub frame_count: u64,
    pub dropped_frames: u64,
    pub average_fps: f64,
    pub current_fps: f64,
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
    pub uptime_seconds: f64,
}

/// Fixed-size device id cell for enumeration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImagingDeviceId {
    pub id: [c_char; 128],
}

/// Invoked on the producer thread with each delivered frame.
pub type ImagingFrameCallback = unsafe extern "C" fn(*const ImagingFrame);
/// Invoked with `(device_id, added)` on device arrival/removal.
pub type ImagingDeviceChangeCallback = unsafe extern "C" fn(*const c_char, c_int);

struct HandleEntry {
    service: Arc<AcquisitionService>,
    registry_name: String,
    /// Staging buffer for `get_latest_frame`; the heap allocation backs the
    /// data pointer handed to the caller.
    scratch: Vec<u8>,
}

struct FfiState {
    services: BTreeMap<u64, HandleEntry>,
    next_handle: u64,
}

static STATE: Lazy<Mutex<FfiState>> = Lazy::new(|| {
    Mutex::new(FfiState {
        services: BTreeMap::new(),
        next_handle: 1,
    })
});

fn status_of(error: &ImagingError) -> ImagingStatus {
    match error {
        ImagingError::InvalidArgument(_)
        | ImagingError::InvalidSize(_)
        | ImagingError::Configuration(_) => ImagingStatus::InvalidArgument,
        ImagingError::InvalidHandle => ImagingStatus::InvalidHandle,
        ImagingError::NotInitialized => ImagingStatus::NotInitialized,
        ImagingError::AlreadyRunning | ImagingError::AlreadyExists(_) => {
            ImagingStatus::AlreadyRunning
        }
        ImagingError::NotRunning => ImagingStatus::NotRunning,
        ImagingError::DeviceNotFound(_) | ImagingError::InitFailed(_) => {
            ImagingStatus::DeviceError
        }
        ImagingError::CreationFailed(_)
        | ImagingError::PermissionDenied(_)
        | ImagingError::Io(_) => ImagingStatus::CommunicationError,
        ImagingError::BufferFull
        | ImagingError::BufferEmpty
        | ImagingError::Timeout
        | ImagingError::ReadFailed(_)
        | ImagingError::WriteFailed(_) => ImagingStatus::ProcessingError,
        ImagingError::NotSupported(_) | ImagingError::FeatureNotSupported(_) => {
            ImagingStatus::NotImplemented
        }
        ImagingError::OutOfMemory | ImagingError::Internal(_) => ImagingStatus::InternalError,
    }
}

/// Copy a Rust string into a fixed C char array, always NUL-terminated.
fn copy_c_str(dst: &mut [c_char], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    for (i, &b) in bytes[..n].iter().enumerate() {
        dst[i] = b as c_char;
    }
    dst[n] = 0;
}

/// Read an optional C string; None for null pointers.
///
/// # Safety
///
/// Non-null pointers must reference NUL-terminated strings.
unsafe fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

/// Create a new service. Returns zero on internal failure.
#[no_mangle]
pub extern "C" fn imaging_service_create() -> ImagingServiceHandle {
    let mut state = STATE.lock();
    let handle = state.next_handle;
    let registry_name = format!("ffi_service_{handle}");

    match ServiceRegistry::global().create(&registry_name) {
        Ok(service) => {
            state.next_handle += 1;
            state.services.insert(
                handle,
                HandleEntry {
                    service,
                    registry_name,
                    scratch: Vec::new(),
                },
            );
            handle
        }
        Err(e) => {
            warn!(error = %e, "ffi service creation failed");
            0
        }
    }
}

/// Destroy a service, stopping it first when running.
#[no_mangle]
pub extern "C" fn imaging_service_destroy(handle: ImagingServiceHandle) -> ImagingStatus {
    let entry = STATE.lock().services.remove(&handle);
    match entry {
        Some(entry) => {
            ServiceRegistry::global().destroy(&entry.registry_name);
            ImagingStatus::Ok
        }
        None => ImagingStatus::InvalidHandle,
    }
}

fn with_service<F>(handle: ImagingServiceHandle, f: F) -> ImagingStatus
where
    F: FnOnce(&Arc<AcquisitionService>) -> ImagingStatus,
{
    let service = {
        let state = STATE.lock();
        match state.services.get(&handle) {
            Some(entry) => Arc::clone(&entry.service),
            None => return ImagingStatus::InvalidHandle,
        }
    };
    f(&service)
}

#[no_mangle]
pub extern "C" fn imaging_service_initialize(
    handle: ImagingServiceHandle,
    config: *const ImagingServiceConfig,
) -> ImagingStatus {
    if config.is_null() {
        return ImagingStatus::InvalidArgument;
    }
    // SAFETY: null-checked; the caller owns the struct for the call.
    let c = unsafe { *config };

    let backing = match BackingKind::from_code(c.shared_memory_type as u8) {
        Ok(backing) => backing,
        Err(e) => return status_of(&e),
    };

    let mut service_config = ServiceConfig::default();
    // SAFETY: read_c_str contract is the C string convention of this ABI.
    unsafe {
        service_config.device_id = read_c_str(c.device_id);
        if let Some(name) = read_c_str(c.shared_memory_name) {
            service_config.shared_memory.name = name;
        }
        if let Some(format) = read_c_str(c.pixel_format) {
            service_config.capture.pixel_format = PixelFormat::from_name(&format);
        }
    }
    if c.width > 0 {
        service_config.capture.width = c.width as u32;
    }
    if c.height > 0 {
        service_config.capture.height = c.height as u32;
    }
    if c.frame_rate > 0.0 {
        service_config.capture.frame_rate = c.frame_rate;
    }
    service_config.capture.enable_audio = c.enable_audio != 0;
    service_config.enable_shared_memory = c.enable_shared_memory != 0;
    service_config.shared_memory.backing = backing;
    if c.shared_memory_size > 0 {
        service_config.shared_memory.size = c.shared_memory_size;
    }
    if c.max_frame_size > 0 {
        service_config.shared_memory.max_frame_size = c.max_frame_size;
    }
    if c.frame_buffer_size > 0 {
        service_config.frame_buffer_size = c.frame_buffer_size as usize;
    }
    service_config.shared_memory.drop_frames_when_full = c.drop_frames_when_full != 0;

    with_service(handle, |service| match service.initialize(service_config) {
        Ok(()) => ImagingStatus::Ok,
        Err(e) => status_of(&e),
    })
}

#[no_mangle]
pub extern "C" fn imaging_service_start(handle: ImagingServiceHandle) -> ImagingStatus {
    with_service(handle, |service| match service.start() {
        Ok(()) => ImagingStatus::Ok,
        Err(e) => status_of(&e),
    })
}

#[no_mangle]
pub extern "C" fn imaging_service_stop(handle: ImagingServiceHandle) -> ImagingStatus {
    with_service(handle, |service| match service.stop() {
        Ok(()) => ImagingStatus::Ok,
        Err(e) => status_of(&e),
    })
}

/// 1 when the service is running, 0 otherwise (including bad handles).
#[no_mangle]
pub extern "C" fn imaging_service_is_running(handle: ImagingServiceHandle) -> c_int {
    let state = STATE.lock();
    state
        .services
        .get(&handle)
        .map(|entry| entry.service.is_running() as c_int)
        .unwrap_or(0)
}

/// Copy the most recent frame into `out`.
///
/// The data pointer references a per-handle staging buffer that is valid
/// until the next call on the same handle.
#[no_mangle]
pub extern "C" fn imaging_service_get_latest_frame(
    handle: ImagingServiceHandle,
    out: *mut ImagingFrame,
) -> ImagingStatus {
    if out.is_null() {
        return ImagingStatus::InvalidArgument;
    }

    let mut state = STATE.lock();
    let Some(entry) = state.services.get_mut(&handle) else {
        return ImagingStatus::InvalidHandle;
    };

    let frame = match entry.service.latest_frame() {
        Ok(frame) => frame,
        Err(e) => return status_of(&e),
    };
    let payload = match frame.data() {
        Ok(payload) => payload,
        Err(e) => return status_of(&e),
    };

    entry.scratch.clear();
    entry.scratch.extend_from_slice(payload);

    let mut c_frame = ImagingFrame {
        frame_id: frame.id(),
        timestamp_ns: frame.timestamp_ns(),
        width: frame.width() as i32,
        height: frame.height() as i32,
        bytes_per_pixel: frame.bytes_per_pixel() as i32,
        data_size: entry.scratch.len(),
        data: entry.scratch.as_ptr(),
        format: [0; 32],
    };
    copy_c_str(&mut c_frame.format, frame.format().name());

    // SAFETY: out is non-null and caller-owned.
    unsafe {
        *out = c_frame;
    }
    ImagingStatus::Ok
}

#[no_mangle]
pub extern "C" fn imaging_service_get_statistics(
    handle: ImagingServiceHandle,
    out: *mut ImagingStatistics,
) -> ImagingStatus {
    if out.is_null() {
        return ImagingStatus::InvalidArgument;
    }
    with_service(handle, |service| {
        let snap = service.metrics_snapshot();
        let stats = ImagingStatistics {
            frame_count: service.frame_count(),
            dropped_frames: service.dropped_count(),
            average_fps: snap.average_fps,
            current_fps: snap.current_fps,
            average_latency_ms: snap.average_latency_ms,
            max_latency_ms: snap.max_latency_ms,
            cpu_usage_percent: snap.cpu_usage_percent,
            memory_usage_mb: snap.memory_usage_mb,
            uptime_seconds: snap.uptime_seconds,
        };
        // SAFETY: out is non-null and caller-owned.
        unsafe {
            *out = stats;
        }
        ImagingStatus::Ok
    })
}

/// Register (or, with null, clear) the frame callback for a service.
///
/// The callback runs on the producer thread; it must return well within a
/// frame interval.
#[no_mangle]
pub extern "C" fn imaging_service_set_frame_callback(
    handle: ImagingServiceHandle,
    callback: Option<ImagingFrameCallback>,
) -> ImagingStatus {
    with_service(handle, |service| {
        match callback {
            Some(callback) => {
                service.set_frame_callback(Arc::new(move |frame| {
                    let payload = match frame.data() {
                        Ok(payload) => payload,
                        Err(_) => return,
                    };
                    let mut c_frame = ImagingFrame {
                        frame_id: frame.id(),
                        timestamp_ns: frame.timestamp_ns(),
                        width: frame.width() as i32,
                        height: frame.height() as i32,
                        bytes_per_pixel: frame.bytes_per_pixel() as i32,
                        data_size: payload.len(),
                        data: payload.as_ptr(),
                        format: [0; 32],
                    };
                    copy_c_str(&mut c_frame.format, frame.format().name());
                    // SAFETY: the pointer is valid for the duration of the
                    // call, which is this ABI's documented contract.
                    unsafe {
                        callback(&c_frame);
                    }
                }));
            }
            None => service.clear_frame_callback(),
        }
        ImagingStatus::Ok
    })
}

/// Enumerate registered devices into a caller-provided array.
#[no_mangle]
pub extern "C" fn imaging_get_available_devices(
    out: *mut ImagingDeviceId,
    max_devices: c_int,
) -> c_int {
    if out.is_null() || max_devices <= 0 {
        return 0;
    }
    let ids = DeviceRegistry::global().device_ids();
    let n = ids.len().min(max_devices as usize);
    for (i, id) in ids.iter().take(n).enumerate() {
        let mut cell = ImagingDeviceId { id: [0; 128] };
        copy_c_str(&mut cell.id, id);
        // SAFETY: i < max_devices and out points at caller storage.
        unsafe {
            *out.add(i) = cell;
        }
    }
    n as c_int
}

/// Subscribe to device hotplug events. Returns a positive subscription id,
/// or -1 on invalid input.
#[no_mangle]
pub extern "C" fn imaging_register_device_callback(
    callback: Option<ImagingDeviceChangeCallback>,
) -> c_int {
    let Some(callback) = callback else {
        return -1;
    };
    let subscription =
        DeviceRegistry::global().register_change_callback(Arc::new(move |device_id, added| {
            let Ok(c_id) = CString::new(device_id) else {
                return;
            };
            // SAFETY: c_id lives across the call; the callback must not
            // retain the pointer.
            unsafe {
                callback(c_id.as_ptr(), added as c_int);
            }
        }));
    subscription as c_int
}

#[no_mangle]
pub extern "C" fn imaging_unregister_device_callback(subscription: c_int) -> ImagingStatus {
    if subscription <= 0 {
        return ImagingStatus::InvalidArgument;
    }
    if DeviceRegistry::global().unregister_change_callback(subscription as u64) {
        ImagingStatus::Ok
    } else {
        ImagingStatus::InvalidArgument
    }
}

#[no_mangle]
pub extern "C" fn imaging_get_device_info(
    device_id: *const c_char,
    out: *mut ImagingDeviceInfo,
) -> ImagingStatus {
    if out.is_null() {
        return ImagingStatus::InvalidArgument;
    }
    // SAFETY: ABI string convention.
    let Some(id) = (unsafe { read_c_str(device_id) }) else {
        return ImagingStatus::InvalidArgument;
    };
    let Some(device) = DeviceRegistry::global().get(&id) else {
        return ImagingStatus::DeviceError;
    };

    let config = device.current_configuration();
    let mut info = ImagingDeviceInfo {
        device_id: [0; 128],
        device_name: [0; 128],
        device_model: [0; 128],
        is_connected: 1,
        is_capturing: device.is_capturing() as c_int,
        width: config.width as i32,
        height: config.height as i32,
        frame_rate: config.frame_rate,
        pixel_format: [0; 32],
    };
    copy_c_str(&mut info.device_id, &device.id());
    copy_c_str(&mut info.device_name, &device.name());
    copy_c_str(&mut info.device_model, &device.model());
    copy_c_str(&mut info.pixel_format, config.pixel_format.name());

    // SAFETY: out is non-null and caller-owned.
    unsafe {
        *out = info;
    }
    ImagingStatus::Ok
}

/// Enumerate a device's supported configurations; returns the count stored.
#[no_mangle]
pub extern "C" fn imaging_get_device_configurations(
    device_id: *const c_char,
    out: *mut ImagingDeviceConfig,
    max_configs: c_int,
) -> c_int {
    if out.is_null() || max_configs <= 0 {
        return 0;
    }
    // SAFETY: ABI string convention.
    let Some(id) = (unsafe { read_c_str(device_id) }) else {
        return 0;
    };
    let Some(device) = DeviceRegistry::global().get(&id) else {
        return 0;
    };

    let configs = device.supported_configurations();
    let n = configs.len().min(max_configs as usize);
    for (i, config) in configs.iter().take(n).enumerate() {
        let mut c_config = ImagingDeviceConfig {
            width: config.width as i32,
            height: config.height as i32,
            frame_rate: config.frame_rate,
            pixel_format: [0; 32],
            supports_audio: config.enable_audio as c_int,
        };
        copy_c_str(&mut c_config.pixel_format, config.pixel_format.name());
        // SAFETY: i < max_configs and out points at caller storage.
        unsafe {
            *out.add(i) = c_config;
        }
    }
    n as c_int
}

/// Library version string; static storage, never freed by the caller.
#[no_mangle]
pub extern "C" fn imaging_get_version() -> *const c_char {
    concat!("rust-imaging ", env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}
