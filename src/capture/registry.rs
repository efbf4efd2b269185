//! Process-wide device registry with hotplug notifications.
//!
//! Capture sources register here by id; the acquisition service resolves
//! devices through the registry (explicit id or first available), and the
//! C ABI's device enumeration and change callbacks are thin wrappers over
//! it. Change callbacks are invoked outside the registry lock and are
//! isolated from panics, so a misbehaving subscriber cannot wedge or crash
//! device management.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, info};

use super::CaptureSource;

/// Notified with `(device_id, added)` on every registry change.
pub type DeviceChangeCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

static GLOBAL: Lazy<DeviceRegistry> = Lazy::new(DeviceRegistry::new);

struct Inner {
    devices: BTreeMap<String, Arc<dyn CaptureSource>>,
    callbacks: BTreeMap<u64, DeviceChangeCallback>,
    next_subscription: u64,
}

/// Named map of capture sources. See the module docs.
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: BTreeMap::new(),
                callbacks: BTreeMap::new(),
                next_subscription: 1,
            }),
        }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static DeviceRegistry {
        &GLOBAL
    }

    /// Register (or replace) a device under its own id.
    pub fn register_device(&self, device: Arc<dyn CaptureSource>) {
        let device_id = device.id();
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.devices.insert(device_id.clone(), device);
            inner.callbacks.values().cloned().collect::<Vec<_>>()
        };
        info!(device = %device_id, "capture device registered");
        notify(&callbacks, &device_id, true);
    }

    /// Remove a device; true if it was present.
    pub fn remove_device(&self, device_id: &str) -> bool {
        let (removed, callbacks) = {
            let mut inner = self.inner.lock();
            let removed = inner.devices.remove(device_id).is_some();
            let callbacks = inner.callbacks.values().cloned().collect::<Vec<_>>();
            (removed, callbacks)
        };
        if removed {
            info!(device = %device_id, "capture device removed");
            notify(&callbacks, device_id, false);
        }
        removed
    }

    /// Ids of all registered devices, in stable order.
    pub fn device_ids(&self) -> Vec<String> {
        self.inner.lock().devices.keys().cloned().collect()
    }

    /// Look up a device by id.
    pub fn get(&self, device_id: &str) -> Option<Arc<dyn CaptureSource>> {
        self.inner.lock().devices.get(device_id).cloned()
    }

    /// The first registered device, if any.
    pub fn first(&self) -> Option<Arc<dyn CaptureSource>> {
        self.inner.lock().devices.values().next().cloned()
    }

    /// Subscribe to device arrival/removal; returns a subscription id.
    pub fn register_change_callback(&self, callback: DeviceChangeCallback) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.callbacks.insert(id, callback);
        id
    }

    /// Drop a subscription; true if it existed.
    pub fn unregister_change_callback(&self, subscription: u64) -> bool {
        self.inner.lock().callbacks.remove(&subscription).is_some()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(callbacks: &[DeviceChangeCallback], device_id: &str, added: bool) {
    for callback in callbacks {
        let cb = Arc::clone(callback);
        if catch_unwind(AssertUnwindSafe(|| cb(device_id, added))).is_err() {
            error!(device = %device_id, "device change callback panicked");
        }
    }
}
