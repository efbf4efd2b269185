//! Frame-acquisition service with a zero-copy shared-memory transport.
//!
//! A producer process ingests uncompressed video frames from a capture
//! source, writes them into a named shared-memory region organized as a
//! lock-free single-producer / multi-consumer ring, and exposes a small
//! control surface for starting, stopping, introspecting and tuning the
//! pipeline. Consumer processes in any language map the same region and
//! read frames without copying.
//!
//! # Architecture
//!
//! ```text
//! vendor callback → CaptureSource → AcquisitionService pump
//!                                        │
//!                            RingProducer │ publish (release store)
//!                                        ▼
//!                     SharedMemoryRegion: control block + metadata + slots
//!                                        ▲
//!                 RingConsumer (latest / cursor / callback) in any process
//! ```
//!
//! The crate is organized leaves-first: [`frame`] (the polymorphic frame
//! object), [`shm`] (region layout and ring protocol), [`capture`] (source
//! interface, device registry, synthetic source), [`service`] (the
//! acquisition service, monitor and service registry), and [`ffi`] (the
//! flat C ABI).

pub mod capture;
pub mod config;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod service;
pub mod shm;

mod threading;

pub use capture::registry::DeviceRegistry;
pub use capture::synthetic::SyntheticSource;
pub use capture::{Capabilities, CaptureSource, CaptureState, Feature};
pub use config::{BackingKind, CaptureConfig, RegionRole, ServiceConfig, SharedMemoryConfig};
pub use error::{ImagingError, Result};
pub use frame::{Frame, FrameDataKind, FrameMetadata, PixelFormat};
pub use service::registry::ServiceRegistry;
pub use service::{AcquisitionService, ServiceState};
pub use shm::{RingConsumer, RingProducer, SharedMemoryRegion};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
