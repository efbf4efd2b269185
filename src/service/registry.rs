//! Process-wide registry of named acquisition services.
//!
//! The C ABI and embedding applications address services by name through
//! this registry. Destroying a service stops it first; dropping the
//! registry destroys everything it still holds, which is the registry's
//! contract rather than an ambient side effect.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::AcquisitionService;
use crate::error::{ImagingError, Result};

static GLOBAL: Lazy<ServiceRegistry> = Lazy::new(ServiceRegistry::new);

/// Named map of [`AcquisitionService`] instances.
pub struct ServiceRegistry {
    services: Mutex<BTreeMap<String, Arc<AcquisitionService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(BTreeMap::new()),
        }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static ServiceRegistry {
        &GLOBAL
    }

    /// Create a service under `name`. Fails with `AlreadyExists` when the
    /// name is taken.
    pub fn create(&self, name: &str) -> Result<Arc<AcquisitionService>> {
        let mut services = self.services.lock();
        if services.contains_key(name) {
            return Err(ImagingError::AlreadyExists(name.to_string()));
        }
        let service = AcquisitionService::new(name);
        services.insert(name.to_string(), Arc::clone(&service));
        info!(service = %name, "service created");
        Ok(service)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AcquisitionService>> {
        self.services.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }

    /// Remove a service, stopping it first when it is running. True when
    /// the name existed.
    pub fn destroy(&self, name: &str) -> bool {
        let service = self.services.lock().remove(name);
        match service {
            Some(service) => {
                if service.is_running() {
                    if let Err(e) = service.stop() {
                        warn!(service = %name, error = %e, "stop during destroy failed");
                    }
                }
                info!(service = %name, "service destroyed");
                true
            }
            None => false,
        }
    }

    /// Destroy every registered service.
    pub fn destroy_all(&self) {
        let names = self.names();
        for name in names {
            self.destroy(&name);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
