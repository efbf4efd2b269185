//! Thread scheduling helpers.
//!
//! Best-effort tuning: failures (typically missing privileges or cgroup
//! limits) are logged and ignored, never propagated.

use tracing::{debug, warn};

/// `SCHED_RR` priority used for transport-adjacent threads: medium-high in
/// the 1..=99 range.
pub(crate) const REALTIME_PRIORITY: libc::c_int = 60;

/// Request `SCHED_RR` for the calling thread.
pub(crate) fn apply_realtime_priority() {
    let param = libc::sched_param {
        sched_priority: REALTIME_PRIORITY,
    };
    // SAFETY: plain syscall on the calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "SCHED_RR not available; staying on the default scheduler"
        );
    } else {
        debug!(priority = REALTIME_PRIORITY, "thread running under SCHED_RR");
    }
}

/// Pin the calling thread to one CPU.
pub(crate) fn apply_affinity(cpu: usize) {
    // SAFETY: cpu_set_t is POD; CPU_ZERO/CPU_SET initialize it fully.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(
                cpu,
                error = %std::io::Error::last_os_error(),
                "thread affinity request failed"
            );
        }
    }
}
