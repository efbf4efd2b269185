//! Synthetic capture source.
//!
//! Generates a moving test pattern at a configured rate, exercising the full
//! delivery contract of a vendor capture card: frames are delivered on a
//! dedicated thread as borrowed buffers drawn from a fixed pool, and each
//! buffer returns to the pool through the frame's release hook. Used for
//! bring-up, the CLI's default device and the test suite.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Capabilities, CaptureSource, CaptureState, FrameCallback};
use crate::config::CaptureConfig;
use crate::error::{ImagingError, Result};
use crate::frame::{Frame, FrameMetadata, PixelFormat};

type BufferPool = Arc<Mutex<Vec<Box<[u8]>>>>;

struct Inner {
    state: CaptureState,
    config: CaptureConfig,
}

/// Pattern-generator capture source. See the module docs.
pub struct SyntheticSource {
    device_id: String,
    device_name: String,
    inner: Mutex<Inner>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Monotone frame-id counter; never reset so ids stay strictly
    /// increasing across capture sessions.
    next_frame_id: Arc<AtomicU64>,
    frames_delivered: Arc<AtomicU64>,
    buffers_allocated: Arc<AtomicU64>,
    callback_panics: Arc<AtomicU64>,
    signal_locked: Arc<AtomicBool>,
    measured_fps: Arc<Mutex<f64>>,
    pool: BufferPool,
}

impl SyntheticSource {
    pub fn new(index: usize) -> Self {
        Self {
            device_id: format!("synthetic_{index}"),
            device_name: format!("Synthetic Pattern Generator {index}"),
            inner: Mutex::new(Inner {
                state: CaptureState::Disconnected,
                config: CaptureConfig::default(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            next_frame_id: Arc::new(AtomicU64::new(0)),
            frames_delivered: Arc::new(AtomicU64::new(0)),
            buffers_allocated: Arc::new(AtomicU64::new(0)),
            callback_panics: Arc::new(AtomicU64::new(0)),
            signal_locked: Arc::new(AtomicBool::new(true)),
            measured_fps: Arc::new(Mutex::new(0.0)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Simulate input signal loss; affects the quality metadata of
    /// subsequently delivered frames.
    pub fn set_signal_locked(&self, locked: bool) {
        self.signal_locked.store(locked, Ordering::Relaxed);
    }
}

impl CaptureSource for SyntheticSource {
    fn id(&self) -> String {
        self.device_id.clone()
    }

    fn name(&self) -> String {
        self.device_name.clone()
    }

    fn model(&self) -> String {
        "rust-imaging synthetic".to_string()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            dma: false,
            gpu_direct: false,
            hw_timestamp: false,
            external_trigger: false,
            multi_stream: false,
            roi: false,
            supported_formats: vec![PixelFormat::Yuv, PixelFormat::Bgra],
        }
    }

    fn state(&self) -> CaptureState {
        self.inner.lock().state
    }

    fn initialize(&self, config: &CaptureConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == CaptureState::Capturing {
            return Err(ImagingError::AlreadyRunning);
        }
        if config.width == 0 || config.height == 0 || config.frame_rate <= 0.0 {
            return Err(ImagingError::Configuration(
                "synthetic source needs non-zero geometry and rate".to_string(),
            ));
        }
        inner.config = config.clone();
        inner.state = CaptureState::Initialized;
        debug!(device = %self.device_id, width = config.width, height = config.height,
               rate = config.frame_rate, "synthetic source initialized");
        Ok(())
    }

    fn start(&self, callback: FrameCallback) -> Result<()> {
        let config = {
            let mut inner = self.inner.lock();
            match inner.state {
                CaptureState::Disconnected => return Err(ImagingError::NotInitialized),
                CaptureState::Capturing => return Err(ImagingError::AlreadyRunning),
                CaptureState::Initialized => {}
            }
            inner.state = CaptureState::Capturing;
            inner.config.clone()
        };

        let width = config.width;
        let height = config.height;
        let bytes_per_pixel = config.pixel_format.bytes_per_pixel();
        let frame_bytes = config.frame_bytes();
        let rate = config.frame_rate;
        let device_id = self.device_id.clone();
        let exposure_ms = 1000.0 / rate;

        // Seed the pool with the configured number of delivery buffers;
        // stale buffers of another geometry are discarded on reuse.
        {
            let mut pool = self.pool.lock();
            pool.clear();
            for _ in 0..config.buffer_count.max(1) {
                pool.push(vec![0u8; frame_bytes].into_boxed_slice());
                self.buffers_allocated.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let pool = Arc::clone(&self.pool);
        let next_frame_id = Arc::clone(&self.next_frame_id);
        let frames_delivered = Arc::clone(&self.frames_delivered);
        let buffers_allocated = Arc::clone(&self.buffers_allocated);
        let callback_panics = Arc::clone(&self.callback_panics);
        let signal_locked = Arc::clone(&self.signal_locked);
        let measured_fps = Arc::clone(&self.measured_fps);

        let thread = std::thread::Builder::new()
            .name(format!("capture-{device_id}"))
            .spawn(move || {
                let interval = Duration::from_secs_f64(1.0 / rate);
                let mut next_deadline = Instant::now();
                let mut frame_number = 0u64;
                let mut window_start = Instant::now();
                let mut window_count = 0u64;

                while running.load(Ordering::Acquire) {
                    let mut buffer = loop {
                        match pool.lock().pop() {
                            Some(buf) if buf.len() == frame_bytes => break buf,
                            Some(_) => continue, // stale geometry, discard
                            None => {
                                // Pool exhausted: the pump is holding more
                                // frames than we have buffers. Grow rather
                                // than starve delivery.
                                buffers_allocated.fetch_add(1, Ordering::Relaxed);
                                break vec![0u8; frame_bytes].into_boxed_slice();
                            }
                        }
                    };

                    fill_pattern(&mut buffer, frame_bytes / height as usize, frame_number);

                    let frame_id = next_frame_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let locked = signal_locked.load(Ordering::Relaxed);
                    let ptr = buffer.as_mut_ptr();
                    let len = buffer.len();
                    let return_pool = Arc::clone(&pool);
                    let release: Box<dyn FnOnce() + Send> = Box::new(move || {
                        return_pool.lock().push(buffer);
                    });

                    // SAFETY: the buffer's heap allocation is owned by the
                    // release closure stored inside the frame, so the
                    // pointer stays valid until the hook runs on drop.
                    let frame = unsafe {
                        Frame::from_borrowed(
                            ptr,
                            len,
                            width,
                            height,
                            bytes_per_pixel,
                            config.pixel_format,
                            Some(release),
                        )
                    };

                    match frame {
                        Ok(mut frame) => {
                            frame.set_id(frame_id);
                            let mut metadata =
                                FrameMetadata::from_signal_lock(&device_id, frame_number, locked);
                            metadata.exposure_time_ms = exposure_ms;
                            frame.metadata = metadata;
                            frame.set_attribute("timecode", &timecode(frame_number, rate));

                            // Delivery errors never escape back into the
                            // generator loop.
                            let cb = Arc::clone(&callback);
                            if catch_unwind(AssertUnwindSafe(move || cb(frame))).is_err() {
                                callback_panics.fetch_add(1, Ordering::Relaxed);
                            } else {
                                frames_delivered.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            warn!(device = %device_id, error = %e, "frame construction failed");
                        }
                    }

                    frame_number += 1;
                    window_count += 1;
                    let window_elapsed = window_start.elapsed();
                    if window_elapsed >= Duration::from_secs(1) {
                        *measured_fps.lock() = window_count as f64 / window_elapsed.as_secs_f64();
                        window_start = Instant::now();
                        window_count = 0;
                    }

                    next_deadline += interval;
                    let now = Instant::now();
                    if next_deadline > now {
                        std::thread::sleep(next_deadline - now);
                    } else {
                        // Fell behind; do not try to catch up in a burst.
                        next_deadline = now;
                    }
                }
            })
            .map_err(|e| ImagingError::Internal(format!("capture thread spawn: {e}")))?;

        *self.thread.lock() = Some(thread);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.state != CaptureState::Capturing {
                return Err(ImagingError::NotRunning);
            }
        }

        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        self.inner.lock().state = CaptureState::Initialized;
        *self.measured_fps.lock() = 0.0;
        Ok(())
    }

    fn supported_configurations(&self) -> Vec<CaptureConfig> {
        let mut configs = Vec::new();
        for (width, height, frame_rate) in [
            (1920, 1080, 60.0),
            (1920, 1080, 30.0),
            (1280, 720, 60.0),
            (640, 480, 30.0),
        ] {
            for pixel_format in [PixelFormat::Yuv, PixelFormat::Bgra] {
                configs.push(CaptureConfig {
                    width,
                    height,
                    frame_rate,
                    pixel_format,
                    ..Default::default()
                });
            }
        }
        configs
    }

    fn current_configuration(&self) -> CaptureConfig {
        self.inner.lock().config.clone()
    }

    fn current_frame_rate(&self) -> f64 {
        *self.measured_fps.lock()
    }

    fn diagnostics(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("model".to_string(), self.model());
        map.insert(
            "frames_delivered".to_string(),
            self.frames_delivered.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "buffers_allocated".to_string(),
            self.buffers_allocated.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "callback_panics".to_string(),
            self.callback_panics.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "signal_locked".to_string(),
            self.signal_locked.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "pool_free".to_string(),
            self.pool.lock().len().to_string(),
        );
        map
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        // Read the state into a local so the guard is released before
        // stop() re-locks.
        let capturing = { self.inner.lock().state == CaptureState::Capturing };
        if capturing {
            let _ = self.stop();
        }
    }
}

/// Horizontal bands scrolling one row per frame.
fn fill_pattern(buffer: &mut [u8], stride: usize, frame_number: u64) {
    for (row, chunk) in buffer.chunks_mut(stride.max(1)).enumerate() {
        chunk.fill(((row as u64 + frame_number) & 0xFF) as u8);
    }
}

/// `HH:MM:SS:FF` timecode for a frame number at a nominal rate.
fn timecode(frame_number: u64, rate: f64) -> String {
    let fps = rate.round().max(1.0) as u64;
    let total_seconds = frame_number / fps;
    let frames = frame_number % fps;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds / 60) % 60,
        total_seconds % 60,
        frames
    )
}
