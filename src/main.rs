//! Producer CLI for the imaging service.
//!
//! Binds a capture device to a shared-memory region and runs until
//! interrupted, printing a once-per-second dashboard line. A readiness
//! sentinel file is written when diagnostics are enabled so supervising
//! processes can wait for the pipeline to come up.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_imaging::{
    BackingKind, DeviceRegistry, PixelFormat, ServiceConfig, ServiceRegistry, SyntheticSource,
};

/// Path supervisors poll to learn the pipeline is up.
const READY_SENTINEL: &str = "/tmp/imaging_service_ready";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[derive(Parser, Debug)]
#[command(
    name = "imaging-service",
    about = "Frame acquisition service with a shared-memory transport",
    version
)]
struct Args {
    /// Device id to use; defaults to the first available device.
    #[arg(long)]
    device: Option<String>,

    /// Capture width in pixels.
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Capture height in pixels.
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Capture frame rate.
    #[arg(long, default_value_t = 60.0)]
    frame_rate: f64,

    /// Pixel format (YUV, BGRA, YUV10, RGB10).
    #[arg(long, default_value = "YUV")]
    pixel_format: String,

    /// Disable DMA delivery buffers.
    #[arg(long)]
    no_direct_memory: bool,

    /// Do not request realtime scheduling for the monitor thread.
    #[arg(long)]
    no_realtime: bool,

    /// Pin the monitor thread to this CPU (negative leaves it unpinned).
    #[arg(long, default_value_t = -1)]
    thread_affinity: i32,

    /// Do not attempt to lock the shared region into RAM.
    #[arg(long)]
    no_pin_memory: bool,

    /// Disable the shared-memory transport entirely.
    #[arg(long)]
    no_shared_memory: bool,

    /// Name of the shared-memory region.
    #[arg(long, default_value = "imaging_frames")]
    shared_memory_name: String,

    /// Size of the shared-memory region in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    shared_memory_size: usize,

    /// Backing kind: 0 = POSIX shm, 1 = System V, 2 = mapped file,
    /// 3 = huge pages.
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    shared_memory_type: u8,

    /// Capacity of the internal most-recent-frames ring.
    #[arg(long, default_value_t = 120)]
    buffer_size: usize,

    /// Wait (bounded) instead of dropping frames when the ring is full.
    #[arg(long)]
    no_drop_frames: bool,

    /// Emit the periodic monitor summary line.
    #[arg(long)]
    enable_logging: bool,

    /// Interval between monitor summary lines, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    log_interval: u64,

    /// Write a statistics JSON document to this path every second and
    /// maintain the readiness sentinel.
    #[arg(long)]
    diagnostics_file: Option<PathBuf>,

    /// Nice value applied to the whole process.
    #[arg(long, value_parser = clap::value_parser!(i32).range(-20..=19))]
    nice_value: Option<i32>,
}

impl Args {
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = ServiceConfig::default();
        config.device_id = self.device.clone();
        config.capture.width = self.width;
        config.capture.height = self.height;
        config.capture.frame_rate = self.frame_rate;
        config.capture.pixel_format = PixelFormat::from_name(&self.pixel_format);
        config.capture.enable_dma = !self.no_direct_memory;
        config.enable_shared_memory = !self.no_shared_memory;
        config.shared_memory.name = self.shared_memory_name.clone();
        config.shared_memory.size = self.shared_memory_size;
        config.shared_memory.backing = BackingKind::from_code(self.shared_memory_type)
            .context("invalid shared memory type")?;
        config.shared_memory.lock_in_ram = !self.no_pin_memory;
        config.shared_memory.drop_frames_when_full = !self.no_drop_frames;
        config.shared_memory.max_frame_size = config.capture.frame_bytes();
        config.frame_buffer_size = self.buffer_size;
        config.enable_logging = self.enable_logging;
        config.log_interval = Duration::from_millis(self.log_interval.max(1));
        config.thread_affinity = self.thread_affinity;
        config.realtime_priority = !self.no_realtime;
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("imaging-service: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    // SAFETY: installing a signal handler that only touches an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    if let Some(nice) = args.nice_value {
        // SAFETY: plain setpriority call on this process.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
        if rc != 0 {
            warn!(
                nice,
                error = %std::io::Error::last_os_error(),
                "could not apply nice value"
            );
        }
    }

    // The synthetic generator stands in for capture hardware; real vendor
    // sources register themselves here the same way.
    DeviceRegistry::global().register_device(Arc::new(SyntheticSource::new(0)));

    let device_ids = DeviceRegistry::global().device_ids();
    if device_ids.is_empty() {
        bail!("no capture devices found");
    }
    println!("Available devices:");
    for id in &device_ids {
        if let Some(device) = DeviceRegistry::global().get(id) {
            println!("  {id}: {} ({})", device.name(), device.model());
        }
    }

    let config = args.service_config()?;
    let service = ServiceRegistry::global()
        .create("imaging")
        .context("service creation failed")?;

    info!("initializing imaging service");
    service
        .initialize(config.clone())
        .context("service initialization failed")?;

    info!("starting imaging service");
    if let Err(e) = service.start() {
        ServiceRegistry::global().destroy("imaging");
        return Err(anyhow::Error::new(e).context("service start failed"));
    }

    let diagnostics_enabled = args.diagnostics_file.is_some();
    if diagnostics_enabled {
        std::fs::write(READY_SENTINEL, b"ready\n").context("readiness sentinel")?;
    }

    println!("Service running. Press Ctrl+C to stop.");
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));

        let stats = service.statistics();
        let get = |key: &str| stats.get(key).map(String::as_str).unwrap_or("0");
        println!(
            "frames {:>8}  fps {:>6}  dropped {:>6}  buffer_full {:>6}  latency_ms {:>8}",
            get("frame_count"),
            get("current_fps"),
            get("dropped_frames"),
            get("buffer_full_events"),
            get("average_latency_ms"),
        );

        if let Some(path) = &args.diagnostics_file {
            let doc = serde_json::json!({
                "config": &config,
                "statistics": &stats,
            });
            if let Err(e) = std::fs::write(path, serde_json::to_vec_pretty(&doc)?) {
                warn!(path = %path.display(), error = %e, "diagnostics dump failed");
            }
        }
    }

    println!("Stopping imaging service...");
    service.stop().context("service stop failed")?;
    ServiceRegistry::global().destroy("imaging");

    if diagnostics_enabled {
        let _ = std::fs::remove_file(READY_SENTINEL);
    }

    println!("Service stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_map_onto_the_service_config() {
        let args = Args::parse_from([
            "imaging-service",
            "--device",
            "synthetic_0",
            "--width",
            "1280",
            "--height",
            "720",
            "--frame-rate",
            "30",
            "--pixel-format",
            "BGRA",
            "--no-realtime",
            "--no-pin-memory",
            "--no-drop-frames",
            "--shared-memory-name",
            "probe_a",
            "--shared-memory-type",
            "2",
            "--buffer-size",
            "32",
            "--thread-affinity",
            "3",
        ]);

        let config = args.service_config().unwrap();
        assert_eq!(config.device_id.as_deref(), Some("synthetic_0"));
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.capture.frame_rate, 30.0);
        assert_eq!(config.capture.pixel_format, PixelFormat::Bgra);
        assert!(!config.realtime_priority);
        assert!(!config.shared_memory.lock_in_ram);
        assert!(!config.shared_memory.drop_frames_when_full);
        assert_eq!(config.shared_memory.name, "probe_a");
        assert_eq!(config.shared_memory.backing, BackingKind::MappedFile);
        assert_eq!(config.frame_buffer_size, 32);
        assert_eq!(config.thread_affinity, 3);
        // Slot sizing follows the configured geometry: 1280 * 720 * 4.
        assert_eq!(config.shared_memory.max_frame_size, 1280 * 720 * 4);
    }

    #[test]
    fn test_shared_memory_type_range_is_enforced() {
        assert!(Args::try_parse_from(["imaging-service", "--shared-memory-type", "4"]).is_err());
        assert!(Args::try_parse_from(["imaging-service", "--nice-value", "-30"]).is_err());
    }
}
