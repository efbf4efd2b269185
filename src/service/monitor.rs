//! Performance monitoring for the acquisition service.
//!
//! The service's frame handler records per-frame timing into bounded
//! histories; a monitor thread wakes once a second, recomputes the derived
//! rates and latency aggregates, samples process CPU and RSS from `/proc`,
//! and optionally emits a one-line summary. The monitor never touches the
//! ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::info;

use crate::frame::now_ns;
use crate::threading::{apply_affinity, apply_realtime_priority};

/// Bounded history of instantaneous frame rates (one second at 60 fps).
const FPS_HISTORY_LEN: usize = 60;
/// Bounded history of capture-to-handler latencies.
const LATENCY_HISTORY_LEN: usize = 300;
/// Monitor sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Shared counters and timing histories. The atomics are updated from the
/// delivery thread without locks; the mutex-guarded interior holds the
/// histories and the derived aggregates.
pub struct Metrics {
    pub frame_count: CachePadded<AtomicU64>,
    pub dropped_frames: CachePadded<AtomicU64>,
    pub buffer_full_events: AtomicU64,
    pub write_errors: AtomicU64,
    inner: Mutex<MetricsInner>,
}

struct MetricsInner {
    start_time: Option<Instant>,
    last_frame_at: Option<Instant>,
    fps_history: VecDeque<f64>,
    latency_ms: VecDeque<f64>,
    derived: MetricsSnapshot,
}

/// Derived aggregates recomputed by the monitor every second.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub average_fps: f64,
    pub current_fps: f64,
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frame_count: CachePadded::new(AtomicU64::new(0)),
            dropped_frames: CachePadded::new(AtomicU64::new(0)),
            buffer_full_events: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            inner: Mutex::new(MetricsInner {
                start_time: None,
                last_frame_at: None,
                fps_history: VecDeque::with_capacity(FPS_HISTORY_LEN),
                latency_ms: VecDeque::with_capacity(LATENCY_HISTORY_LEN),
                derived: MetricsSnapshot::default(),
            }),
        })
    }

    /// Reset all counters and histories at session start.
    pub fn reset(&self) {
        self.frame_count.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.buffer_full_events.store(0, Ordering::Relaxed);
        self.write_errors.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.start_time = Some(Instant::now());
        inner.last_frame_at = None;
        inner.fps_history.clear();
        inner.latency_ms.clear();
        inner.derived = MetricsSnapshot::default();
    }

    /// Record one delivered frame. Called from the delivery thread; the
    /// critical section is two deque pushes.
    pub fn record_frame(&self, capture_timestamp_ns: u64) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let latency_ms = (now_ns().saturating_sub(capture_timestamp_ns)) as f64 / 1_000_000.0;

        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_frame_at {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                if inner.fps_history.len() == FPS_HISTORY_LEN {
                    inner.fps_history.pop_front();
                }
                inner.fps_history.push_back(1.0 / dt);
            }
        }
        inner.last_frame_at = Some(now);

        if inner.latency_ms.len() == LATENCY_HISTORY_LEN {
            inner.latency_ms.pop_front();
        }
        inner.latency_ms.push_back(latency_ms);
    }

    /// Recompute the derived aggregates; called by the monitor thread.
    fn recompute(&self, cpu_usage_percent: f64, memory_usage_mb: f64) {
        let frames = self.frame_count.load(Ordering::Relaxed);
        let mut inner = self.inner.lock();

        let uptime_seconds = inner
            .start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let average_fps = if uptime_seconds > 0.0 {
            frames as f64 / uptime_seconds
        } else {
            0.0
        };
        let current_fps = if inner.fps_history.is_empty() {
            0.0
        } else {
            inner.fps_history.iter().sum::<f64>() / inner.fps_history.len() as f64
        };
        let (average_latency_ms, max_latency_ms) = if inner.latency_ms.is_empty() {
            (0.0, 0.0)
        } else {
            let sum: f64 = inner.latency_ms.iter().sum();
            let max = inner
                .latency_ms
                .iter()
                .cloned()
                .fold(f64::MIN, f64::max);
            (sum / inner.latency_ms.len() as f64, max)
        };

        inner.derived = MetricsSnapshot {
            uptime_seconds,
            average_fps,
            current_fps,
            average_latency_ms,
            max_latency_ms,
            cpu_usage_percent,
            memory_usage_mb,
        };
    }

    /// Latest derived aggregates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().derived.clone()
    }
}

/// Handle to a running monitor thread; stops and joins on
/// [`stop`](MonitorHandle::stop).
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.signal_and_join();
    }

    fn signal_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.signal_and_join();
    }
}

/// Monitor thread configuration.
pub struct MonitorConfig {
    pub service_name: String,
    pub enable_logging: bool,
    pub log_interval: Duration,
    /// CPU to pin the monitor to; negative leaves affinity untouched.
    pub thread_affinity: i32,
    pub realtime_priority: bool,
}

/// Spawn the monitor thread.
pub fn spawn_monitor(metrics: Arc<Metrics>, config: MonitorConfig) -> MonitorHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name(format!("monitor-{}", config.service_name))
        .spawn(move || {
            if config.realtime_priority {
                apply_realtime_priority();
            }
            if config.thread_affinity >= 0 {
                apply_affinity(config.thread_affinity as usize);
            }

            let mut cpu = CpuTracker::new();
            let mut last_log = Instant::now();

            while !thread_stop.load(Ordering::Relaxed) {
                // One-second cadence, sliced so stop() joins promptly.
                let wake = Instant::now() + SAMPLE_INTERVAL;
                while Instant::now() < wake {
                    if thread_stop.load(Ordering::Relaxed) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }

                let cpu_percent = cpu.sample();
                let rss_mb = rss_megabytes();
                metrics.recompute(cpu_percent, rss_mb);

                if config.enable_logging && last_log.elapsed() >= config.log_interval {
                    let snap = metrics.snapshot();
                    info!(
                        service = %config.service_name,
                        frames = metrics.frame_count.load(Ordering::Relaxed),
                        dropped = metrics.dropped_frames.load(Ordering::Relaxed),
                        avg_fps = format_args!("{:.1}", snap.average_fps),
                        cur_fps = format_args!("{:.1}", snap.current_fps),
                        avg_latency_ms = format_args!("{:.2}", snap.average_latency_ms),
                        max_latency_ms = format_args!("{:.2}", snap.max_latency_ms),
                        cpu = format_args!("{:.1}", snap.cpu_usage_percent),
                        rss_mb = format_args!("{:.1}", snap.memory_usage_mb),
                        "acquisition status"
                    );
                    last_log = Instant::now();
                }
            }
        })
        .expect("monitor thread spawn");

    MonitorHandle {
        stop,
        thread: Some(thread),
    }
}

/// CPU usage of this process between consecutive samples.
struct CpuTracker {
    last_ticks: u64,
    last_sample: Instant,
    ticks_per_second: f64,
}

impl CpuTracker {
    fn new() -> Self {
        // SAFETY: sysconf is always safe to call.
        let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as f64;
        Self {
            last_ticks: process_cpu_ticks().unwrap_or(0),
            last_sample: Instant::now(),
            ticks_per_second: if ticks_per_second > 0.0 {
                ticks_per_second
            } else {
                100.0
            },
        }
    }

    fn sample(&mut self) -> f64 {
        let Some(ticks) = process_cpu_ticks() else {
            return 0.0;
        };
        let elapsed = self.last_sample.elapsed().as_secs_f64();
        let used = ticks.saturating_sub(self.last_ticks) as f64 / self.ticks_per_second;
        self.last_ticks = ticks;
        self.last_sample = Instant::now();
        if elapsed > 0.0 {
            (used / elapsed) * 100.0
        } else {
            0.0
        }
    }
}

/// utime + stime of this process in clock ticks, from `/proc/self/stat`.
fn process_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields after the parenthesized comm, which may itself contain spaces.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime/stime are fields 14/15.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Resident set size in megabytes, from `/proc/self/status`.
fn rss_megabytes() -> f64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0.0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Ok(kb) = rest.trim().trim_end_matches("kB").trim().parse::<f64>() {
                return kb / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_frame_updates_histories() {
        let metrics = Metrics::new();
        metrics.reset();

        for _ in 0..5 {
            metrics.record_frame(now_ns());
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(metrics.frame_count.load(Ordering::Relaxed), 5);
        metrics.recompute(0.0, 0.0);
        let snap = metrics.snapshot();
        assert!(snap.average_fps > 0.0);
        assert!(snap.current_fps > 0.0);
        // Handler ran microseconds after the capture stamp.
        assert!(snap.max_latency_ms >= 0.0);
        assert!(snap.max_latency_ms < 1_000.0);
    }

    #[test]
    fn test_histories_are_bounded() {
        let metrics = Metrics::new();
        metrics.reset();
        for _ in 0..(LATENCY_HISTORY_LEN + 50) {
            metrics.record_frame(now_ns());
        }
        let inner = metrics.inner.lock();
        assert!(inner.latency_ms.len() <= LATENCY_HISTORY_LEN);
        assert!(inner.fps_history.len() <= FPS_HISTORY_LEN);
    }

    #[test]
    fn test_reset_clears_state() {
        let metrics = Metrics::new();
        metrics.reset();
        metrics.record_frame(now_ns());
        metrics.dropped_frames.fetch_add(3, Ordering::Relaxed);

        metrics.reset();
        assert_eq!(metrics.frame_count.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.dropped_frames.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.snapshot().average_fps, 0.0);
    }

    #[test]
    fn test_monitor_thread_stops_promptly() {
        let metrics = Metrics::new();
        metrics.reset();
        let handle = spawn_monitor(
            Arc::clone(&metrics),
            MonitorConfig {
                service_name: "test".to_string(),
                enable_logging: false,
                log_interval: Duration::from_secs(1),
                thread_affinity: -1,
                realtime_priority: false,
            },
        );
        let start = Instant::now();
        handle.stop();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_proc_sampling_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(process_cpu_ticks().is_some());
            assert!(rss_megabytes() > 0.0);
        }
    }
}
