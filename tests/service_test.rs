//! Acquisition service lifecycle: pump behavior, statistics, restart
//! semantics and the service registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_imaging::shm::layout::{slot_size, DATA_OFFSET};
use rust_imaging::{
    AcquisitionService, BackingKind, DeviceRegistry, ImagingError, PixelFormat, RingConsumer,
    ServiceConfig, ServiceRegistry, ServiceState, SharedMemoryRegion, SyntheticSource,
};

/// Service config bound to a registered synthetic device, with a small
/// file-backed region under `dir`.
fn test_config(dir: &tempfile::TempDir, device_index: usize, name: &str) -> ServiceConfig {
    DeviceRegistry::global().register_device(Arc::new(SyntheticSource::new(device_index)));

    let mut config = ServiceConfig::default();
    config.device_id = Some(format!("synthetic_{device_index}"));
    config.capture.width = 16;
    config.capture.height = 8;
    config.capture.frame_rate = 200.0;
    config.capture.pixel_format = PixelFormat::Yuv;
    config.capture.buffer_count = 4;
    config.frame_buffer_size = 16;
    config.enable_monitoring = true;
    config.realtime_priority = false;
    config.shared_memory.name = name.to_string();
    config.shared_memory.max_frame_size = config.capture.frame_bytes();
    config.shared_memory.size =
        DATA_OFFSET + 32 * slot_size(config.capture.frame_bytes());
    config.shared_memory.backing = BackingKind::MappedFile;
    config.shared_memory.lock_in_ram = false;
    config.shared_memory.file_path = Some(dir.path().join(name));
    config
}

fn wait_for_frames(service: &AcquisitionService, minimum: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.frame_count() < minimum && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(
        service.frame_count() >= minimum,
        "only {} frames delivered",
        service.frame_count()
    );
}

#[test]
fn full_lifecycle_pumps_frames_into_the_region() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 20, "svc_lifecycle");
    let service = AcquisitionService::new("lifecycle");

    assert_eq!(service.state(), ServiceState::Uninitialized);
    service.initialize(config.clone()).unwrap();
    assert_eq!(service.state(), ServiceState::Initialized);

    service.start().unwrap();
    assert_eq!(service.state(), ServiceState::Running);
    wait_for_frames(&service, 10);

    // The internal ring holds the most recent frame.
    let latest = service.latest_frame().unwrap();
    assert_eq!(latest.width(), 16);
    assert_eq!(latest.height(), 8);

    // Quiesce the producer, then verify frames reached the shared region
    // and are readable from an independent mapping. The region stays alive
    // (and active) across stop; it is torn down with the pump.
    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Initialized);

    let mut consumer_config = config.shared_memory.clone();
    consumer_config.role = rust_imaging::RegionRole::Consumer;
    let consumer_region = SharedMemoryRegion::open(&consumer_config).unwrap();
    let consumer = RingConsumer::attach(consumer_region);
    let mapped = consumer.latest().unwrap();
    assert_eq!(mapped.width(), 16);
    assert_eq!(mapped.data().unwrap().len(), 16 * 8 * 2);
    assert_eq!(mapped.metadata.device_id, "synthetic_20");
}

#[test]
fn statistics_expose_all_documented_keys() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 21, "svc_stats");
    let service = AcquisitionService::new("stats");
    service.initialize(config).unwrap();
    service.start().unwrap();
    wait_for_frames(&service, 5);

    let stats = service.statistics();
    for key in [
        "frame_count",
        "dropped_frames",
        "average_fps",
        "current_fps",
        "average_latency_ms",
        "max_latency_ms",
        "cpu_usage_percent",
        "memory_usage_mb",
        "uptime_seconds",
        "shm_write_index",
        "shm_total_written",
        "shm_dropped",
        "shm_active",
        "device_id",
        "device_frames_delivered",
    ] {
        assert!(stats.contains_key(key), "missing statistics key {key}");
    }
    assert_ne!(stats["frame_count"], "0");
    assert_ne!(stats["shm_write_index"], "0");
    assert_eq!(stats["device_id"], "synthetic_21");

    service.stop().unwrap();
}

#[test]
fn stop_without_start_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 22, "svc_noop");
    let service = AcquisitionService::new("noop");

    assert!(matches!(service.stop(), Err(ImagingError::NotInitialized)));

    service.initialize(config).unwrap();
    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Initialized);
}

#[test]
fn reinitialize_while_running_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 23, "svc_reinit");
    let service = AcquisitionService::new("reinit");

    service.initialize(config.clone()).unwrap();
    service.start().unwrap();
    assert!(matches!(
        service.initialize(config),
        Err(ImagingError::AlreadyRunning)
    ));
    assert!(matches!(service.start(), Err(ImagingError::AlreadyRunning)));
    service.stop().unwrap();
}

#[test]
fn restart_continues_with_increasing_frame_ids() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 24, "svc_restart");
    let service = AcquisitionService::new("restart");
    service.initialize(config).unwrap();

    service.start().unwrap();
    wait_for_frames(&service, 5);
    let first_session_id = service.latest_frame().unwrap().id();
    service.stop().unwrap();

    service.start().unwrap();
    wait_for_frames(&service, 5);
    let second_session_id = service.latest_frame().unwrap().id();
    service.stop().unwrap();

    assert!(
        second_session_id > first_session_id,
        "ids must keep increasing across restart ({second_session_id} vs {first_session_id})"
    );
}

#[test]
fn user_callback_sees_frames_and_panics_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 25, "svc_callback");
    let service = AcquisitionService::new("callback");
    service.initialize(config).unwrap();

    let delivered = Arc::new(AtomicU64::new(0));
    let ids = Arc::new(Mutex::new(Vec::new()));
    let delivered_cb = Arc::clone(&delivered);
    let ids_cb = Arc::clone(&ids);
    service.set_frame_callback(Arc::new(move |frame| {
        ids_cb.lock().push(frame.id());
        // Panic on every other frame; delivery must continue regardless.
        if delivered_cb.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            panic!("callback bug");
        }
    }));

    service.start().unwrap();
    wait_for_frames(&service, 10);
    service.stop().unwrap();

    let ids = ids.lock();
    assert!(ids.len() >= 10);
    for pair in ids.windows(2) {
        assert!(pair[1] > pair[0], "ids delivered out of order");
    }
}

#[test]
fn initialize_with_unknown_device_fails() {
    let service = AcquisitionService::new("nodev");
    let mut config = ServiceConfig::default();
    config.device_id = Some("missing_device".to_string());
    config.enable_shared_memory = false;
    assert!(matches!(
        service.initialize(config),
        Err(ImagingError::DeviceNotFound(_))
    ));
    assert_eq!(service.state(), ServiceState::Uninitialized);
}

#[test]
fn registry_destroy_stops_running_services() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 26, "svc_registry");

    let registry = ServiceRegistry::new();
    let service = registry.create("managed").unwrap();
    service.initialize(config).unwrap();
    service.start().unwrap();
    assert!(service.is_running());

    assert!(registry.destroy("managed"));
    assert!(!service.is_running());
    assert!(registry.get("managed").is_none());
}
