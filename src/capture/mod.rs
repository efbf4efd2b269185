//! Capture sources.
//!
//! A capture source is anything that delivers frames by invoking a callback
//! on its own thread: a vendor capture card SDK in production, the
//! [`SyntheticSource`](synthetic::SyntheticSource) pattern generator in
//! tests and bring-up. The service consumes sources exclusively through the
//! [`CaptureSource`] trait.
//!
//! # Delivery contract
//!
//! On each frame the source wraps the vendor's buffer in a borrowed
//! [`Frame`] whose release hook returns the buffer, fills the structured
//! metadata, stamps system time and a monotone frame id, and calls the
//! registered callback synchronously on the delivery thread. The callback
//! must not block for longer than one frame interval; heavy work is
//! deferred by the service.

pub mod registry;
pub mod synthetic;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;
use crate::error::{ImagingError, Result};
use crate::frame::{Frame, PixelFormat};

/// Callback a source invokes with each delivered frame, synchronously on
/// the vendor's delivery thread.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Lifecycle state of a capture source.
///
/// Transitions: `initialize` requires not-Capturing, `start` requires
/// Initialized, `stop` requires Capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Disconnected,
    Initialized,
    Capturing,
}

/// Optional hardware features a source may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Dma,
    GpuDirect,
    HardwareTimestamp,
    ExternalTrigger,
    MultiStream,
    Roi,
}

/// Capability summary reported by a source.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub dma: bool,
    pub gpu_direct: bool,
    pub hw_timestamp: bool,
    pub external_trigger: bool,
    pub multi_stream: bool,
    pub roi: bool,
    pub supported_formats: Vec<PixelFormat>,
}

impl Capabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Dma => self.dma,
            Feature::GpuDirect => self.gpu_direct,
            Feature::HardwareTimestamp => self.hw_timestamp,
            Feature::ExternalTrigger => self.external_trigger,
            Feature::MultiStream => self.multi_stream,
            Feature::Roi => self.roi,
        }
    }
}

/// Vendor-agnostic capture device interface.
///
/// Implementations use interior mutability: the service shares sources as
/// `Arc<dyn CaptureSource>` across its own threads and the delivery thread.
pub trait CaptureSource: Send + Sync {
    /// Stable device identifier.
    fn id(&self) -> String;

    /// Human-readable device name.
    fn name(&self) -> String;

    /// Device model string.
    fn model(&self) -> String;

    fn capabilities(&self) -> Capabilities;

    fn supports(&self, feature: Feature) -> bool {
        self.capabilities().supports(feature)
    }

    fn state(&self) -> CaptureState;

    /// Apply a configuration. Allowed in any state except Capturing.
    fn initialize(&self, config: &CaptureConfig) -> Result<()>;

    /// Begin delivery. Requires Initialized.
    fn start(&self, callback: FrameCallback) -> Result<()>;

    /// End delivery. Requires Capturing; returns only once the delivery
    /// thread has stopped invoking the callback.
    fn stop(&self) -> Result<()>;

    fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    fn supported_configurations(&self) -> Vec<CaptureConfig>;

    fn current_configuration(&self) -> CaptureConfig;

    /// Measured delivery rate in frames per second.
    fn current_frame_rate(&self) -> f64;

    /// Vendor diagnostics as flat key/value pairs.
    fn diagnostics(&self) -> HashMap<String, String>;

    /// Hand the source an externally allocated delivery buffer.
    ///
    /// # Safety-adjacent contract
    ///
    /// The buffer must stay valid while the source is capturing. Sources
    /// without external-memory support answer `NotSupported`.
    fn set_external_memory(&self, _buffer: *mut u8, _len: usize) -> Result<()> {
        Err(ImagingError::NotSupported(
            "external delivery memory".to_string(),
        ))
    }

    /// Ask the source to write frames directly into a named shared-memory
    /// region, bypassing the service pump.
    fn set_direct_output(&self, _region_name: &str) -> Result<()> {
        Err(ImagingError::NotSupported(
            "direct shared-memory output".to_string(),
        ))
    }
}
