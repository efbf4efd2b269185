//! The acquisition service: binds a capture source to a shared-memory
//! region and pumps frames between them.
//!
//! Lifecycle is `Uninitialized → Initialized → Running → Initialized → …`;
//! re-initialization while running is refused. The frame pump is not a
//! thread of its own: it is the service's frame handler, invoked
//! synchronously on the source's delivery thread, and therefore never
//! blocks longer than the ring's bounded write path. A monitor thread
//! samples derived metrics once a second.
//!
//! # Frame handler
//!
//! The handler's order is fixed and no step may abort the ones after it:
//! count the frame, sample timing, write to the ring (errors logged and
//! counted, never propagated), push into the internal most-recent ring
//! (overwriting the oldest counts as a drop), then invoke the user
//! callback, which is treated as untrusted and isolated from panics.
//!
//! # Locking
//!
//! Lock order is registry → service → metrics → frame ring. No lock is held
//! across a call into the capture source or the user callback, and the
//! producer's publish path takes no service locks at all.

pub mod monitor;
pub mod registry;

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::capture::registry::DeviceRegistry;
use crate::capture::{CaptureSource, FrameCallback};
use crate::config::{RegionRole, ServiceConfig};
use crate::error::{ImagingError, Result};
use crate::frame::Frame;
use crate::shm::region::SharedMemoryRegion;
use crate::shm::ring::RingProducer;
use monitor::{spawn_monitor, Metrics, MonitorConfig, MonitorHandle};

/// Callback invoked with each frame after it has passed through the pump.
pub type ServiceFrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Uninitialized,
    Initialized,
    Running,
}

/// Internal bounded ring of the most recent frames, for consumers that do
/// not map the shared region and for diagnostics.
struct FrameRing {
    slots: Vec<Option<Arc<Frame>>>,
    head: usize,
    tail: usize,
}

impl FrameRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    /// Store a frame; returns true when the oldest entry was overwritten.
    fn push(&mut self, frame: Arc<Frame>) -> bool {
        let capacity = self.slots.len();
        self.slots[self.tail] = Some(frame);
        let overwritten = (self.tail + 1) % capacity == self.head;
        self.tail = (self.tail + 1) % capacity;
        if overwritten {
            self.head = (self.head + 1) % capacity;
        }
        overwritten
    }

    /// Most recently pushed frame.
    fn latest(&self) -> Option<Arc<Frame>> {
        let capacity = self.slots.len();
        self.slots[(self.tail + capacity - 1) % capacity].clone()
    }
}

/// State shared with the delivery thread. A new pump is built on every
/// `initialize`, so the handler closure owns everything it touches and the
/// service mutex stays out of the hot path.
struct Pump {
    producer: Option<RingProducer>,
    frame_ring: Mutex<FrameRing>,
    user_callback: Arc<Mutex<Option<ServiceFrameCallback>>>,
    metrics: Arc<Metrics>,
}

struct ServiceInner {
    state: ServiceState,
    config: Option<ServiceConfig>,
    source: Option<Arc<dyn CaptureSource>>,
    pump: Option<Arc<Pump>>,
}

/// One frame-acquisition pipeline: a capture source, an optional producer
/// region, the internal frame ring and the performance monitor.
pub struct AcquisitionService {
    name: String,
    inner: Mutex<ServiceInner>,
    monitor: Mutex<Option<MonitorHandle>>,
    user_callback: Arc<Mutex<Option<ServiceFrameCallback>>>,
    metrics: Arc<Metrics>,
}

impl AcquisitionService {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new(ServiceInner {
                state: ServiceState::Uninitialized,
                config: None,
                source: None,
                pump: None,
            }),
            monitor: Mutex::new(None),
            user_callback: Arc::new(Mutex::new(None)),
            metrics: Metrics::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Resolve the device, initialize it, create the producer region and
    /// the internal frame ring, and reset all counters.
    pub fn initialize(&self, config: ServiceConfig) -> Result<()> {
        config.validate()?;

        // Registry lock is ordered before the service lock.
        let source = match &config.device_id {
            Some(id) => DeviceRegistry::global()
                .get(id)
                .ok_or_else(|| ImagingError::DeviceNotFound(id.clone()))?,
            None => DeviceRegistry::global()
                .first()
                .ok_or_else(|| ImagingError::DeviceNotFound("no devices available".to_string()))?,
        };

        if self.inner.lock().state == ServiceState::Running {
            return Err(ImagingError::AlreadyRunning);
        }

        // No service lock across the source call.
        source.initialize(&config.capture)?;

        let producer = if config.enable_shared_memory {
            let mut shm_config = config.shared_memory.clone();
            shm_config.role = RegionRole::Producer;
            let region = SharedMemoryRegion::create(&shm_config)?;
            Some(RingProducer::new(region)?)
        } else {
            None
        };

        let pump = Arc::new(Pump {
            producer,
            frame_ring: Mutex::new(FrameRing::new(config.frame_buffer_size)),
            user_callback: Arc::clone(&self.user_callback),
            metrics: Arc::clone(&self.metrics),
        });

        self.metrics.reset();

        let mut inner = self.inner.lock();
        if inner.state == ServiceState::Running {
            return Err(ImagingError::AlreadyRunning);
        }
        inner.source = Some(Arc::clone(&source));
        inner.pump = Some(pump);
        inner.config = Some(config);
        inner.state = ServiceState::Initialized;

        info!(service = %self.name, device = %source.id(), "service initialized");
        Ok(())
    }

    /// Reset counters, start the monitor and begin capture.
    pub fn start(&self) -> Result<()> {
        let (source, pump, config) = {
            let inner = self.inner.lock();
            match inner.state {
                ServiceState::Uninitialized => return Err(ImagingError::NotInitialized),
                ServiceState::Running => return Err(ImagingError::AlreadyRunning),
                ServiceState::Initialized => {}
            }
            (
                Arc::clone(inner.source.as_ref().expect("initialized service has a source")),
                Arc::clone(inner.pump.as_ref().expect("initialized service has a pump")),
                inner.config.clone().expect("initialized service has a config"),
            )
        };

        self.metrics.reset();

        if config.enable_monitoring {
            let handle = spawn_monitor(
                Arc::clone(&self.metrics),
                MonitorConfig {
                    service_name: self.name.clone(),
                    enable_logging: config.enable_logging,
                    log_interval: config.log_interval,
                    thread_affinity: config.thread_affinity,
                    realtime_priority: config.realtime_priority,
                },
            );
            *self.monitor.lock() = Some(handle);
        }

        let handler_pump = Arc::clone(&pump);
        let handler: FrameCallback = Arc::new(move |frame| handle_frame(&handler_pump, frame));

        if let Err(e) = source.start(handler) {
            *self.monitor.lock() = None;
            error!(service = %self.name, error = %e, "capture source refused to start");
            return Err(e);
        }

        self.inner.lock().state = ServiceState::Running;
        info!(service = %self.name, "service started");
        Ok(())
    }

    /// Stop capture, join the monitor, return to Initialized.
    ///
    /// Calling stop on a service that was initialized but never started is
    /// a no-op.
    pub fn stop(&self) -> Result<()> {
        let source = {
            let inner = self.inner.lock();
            match inner.state {
                ServiceState::Uninitialized => return Err(ImagingError::NotInitialized),
                ServiceState::Initialized => return Ok(()),
                ServiceState::Running => {
                    Arc::clone(inner.source.as_ref().expect("running service has a source"))
                }
            }
        };

        // Returns only after the delivery thread has stopped.
        source.stop()?;

        if let Some(handle) = self.monitor.lock().take() {
            handle.stop();
        }

        self.inner.lock().state = ServiceState::Initialized;
        info!(service = %self.name, "service stopped");
        Ok(())
    }

    /// Register the user frame callback. It runs on the delivery thread
    /// after the ring write; panics are isolated.
    pub fn set_frame_callback(&self, callback: ServiceFrameCallback) {
        *self.user_callback.lock() = Some(callback);
    }

    pub fn clear_frame_callback(&self) {
        *self.user_callback.lock() = None;
    }

    /// Most recent frame held by the internal ring.
    pub fn latest_frame(&self) -> Result<Arc<Frame>> {
        let pump = {
            let inner = self.inner.lock();
            inner
                .pump
                .as_ref()
                .cloned()
                .ok_or(ImagingError::NotInitialized)?
        };
        let frame = pump.frame_ring.lock().latest();
        frame.ok_or(ImagingError::BufferEmpty)
    }

    /// The producer region, when shared memory is enabled.
    pub fn region(&self) -> Option<Arc<SharedMemoryRegion>> {
        let inner = self.inner.lock();
        inner
            .pump
            .as_ref()
            .and_then(|pump| pump.producer.as_ref().map(|p| Arc::clone(p.region())))
    }

    /// Frames handled this session.
    pub fn frame_count(&self) -> u64 {
        self.metrics
            .frame_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Frames dropped by the internal ring this session.
    pub fn dropped_count(&self) -> u64 {
        self.metrics
            .dropped_frames
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Latest derived performance aggregates.
    pub fn metrics_snapshot(&self) -> monitor::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Flattened statistics: service counters, derived metrics,
    /// `shm_`-prefixed region counters and `device_`-prefixed diagnostics.
    pub fn statistics(&self) -> BTreeMap<String, String> {
        use std::sync::atomic::Ordering;

        let mut stats = BTreeMap::new();
        let snap = self.metrics.snapshot();

        stats.insert(
            "frame_count".to_string(),
            self.metrics.frame_count.load(Ordering::Relaxed).to_string(),
        );
        stats.insert(
            "dropped_frames".to_string(),
            self.metrics
                .dropped_frames
                .load(Ordering::Relaxed)
                .to_string(),
        );
        stats.insert(
            "buffer_full_events".to_string(),
            self.metrics
                .buffer_full_events
                .load(Ordering::Relaxed)
                .to_string(),
        );
        stats.insert(
            "write_errors".to_string(),
            self.metrics.write_errors.load(Ordering::Relaxed).to_string(),
        );
        stats.insert("average_fps".to_string(), format!("{:.2}", snap.average_fps));
        stats.insert("current_fps".to_string(), format!("{:.2}", snap.current_fps));
        stats.insert(
            "average_latency_ms".to_string(),
            format!("{:.3}", snap.average_latency_ms),
        );
        stats.insert(
            "max_latency_ms".to_string(),
            format!("{:.3}", snap.max_latency_ms),
        );
        stats.insert(
            "cpu_usage_percent".to_string(),
            format!("{:.1}", snap.cpu_usage_percent),
        );
        stats.insert(
            "memory_usage_mb".to_string(),
            format!("{:.1}", snap.memory_usage_mb),
        );
        stats.insert(
            "uptime_seconds".to_string(),
            format!("{:.1}", snap.uptime_seconds),
        );

        let (source, region) = {
            let inner = self.inner.lock();
            (
                inner.source.clone(),
                inner
                    .pump
                    .as_ref()
                    .and_then(|pump| pump.producer.as_ref().map(|p| Arc::clone(p.region()))),
            )
        };

        if let Some(region) = region {
            let shm = region.stats();
            stats.insert("shm_write_index".to_string(), shm.write_index.to_string());
            stats.insert("shm_read_index".to_string(), shm.read_index.to_string());
            stats.insert("shm_frame_count".to_string(), shm.frame_count.to_string());
            stats.insert(
                "shm_total_written".to_string(),
                shm.total_written.to_string(),
            );
            stats.insert("shm_total_read".to_string(), shm.total_read.to_string());
            stats.insert("shm_dropped".to_string(), shm.dropped.to_string());
            stats.insert("shm_active".to_string(), shm.active.to_string());
            stats.insert(
                "shm_mlock_failed".to_string(),
                shm.mlock_failed.to_string(),
            );
        }

        if let Some(source) = source {
            stats.insert("device_id".to_string(), source.id());
            stats.insert(
                "device_frame_rate".to_string(),
                format!("{:.2}", source.current_frame_rate()),
            );
            for (key, value) in source.diagnostics() {
                stats.insert(format!("device_{key}"), value);
            }
        }

        stats
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        // Read the state into a local so the guard is released before
        // stop() re-locks.
        let running = { self.inner.lock().state == ServiceState::Running };
        if running {
            if let Err(e) = self.stop() {
                warn!(service = %self.name, error = %e, "stop on drop failed");
            }
        }
    }
}

/// The frame pump, run synchronously on the source's delivery thread.
fn handle_frame(pump: &Pump, frame: Frame) {
    // (1) + (2): count and sample timing.
    pump.metrics.record_frame(frame.timestamp_ns());

    // (3): shared-memory publish. BufferFull is expected backpressure;
    // everything else is logged and counted, never propagated.
    if let Some(producer) = &pump.producer {
        match producer.write_frame(&frame) {
            Ok(()) => {}
            Err(ImagingError::BufferFull) => {
                pump.metrics
                    .buffer_full_events
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                pump.metrics
                    .write_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(error = %e, "shared memory write failed");
            }
        }
    }

    // (4): internal most-recent ring; overwriting counts as a drop.
    let frame = Arc::new(frame);
    let overwritten = pump.frame_ring.lock().push(Arc::clone(&frame));
    if overwritten {
        pump.metrics
            .dropped_frames
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    // (5): user callback, isolated; the lock is released before the call.
    let callback = pump.user_callback.lock().clone();
    if let Some(callback) = callback {
        if catch_unwind(AssertUnwindSafe(|| callback(&frame))).is_err() {
            error!("user frame callback panicked");
        }
    }
}
