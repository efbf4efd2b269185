//! Custom error types for the imaging service.
//!
//! This module defines the primary error type, `ImagingError`, used across
//! the whole crate. Using the `thiserror` crate, it provides a centralized
//! and consistent way to handle the different kinds of failures the service
//! can hit, from shared-memory setup problems to ring-protocol conditions
//! that are expected during normal operation.
//!
//! ## Error categories
//!
//! Three groups of variants behave differently:
//!
//! - **Operational statuses** (`BufferFull`, `BufferEmpty`, `Timeout`) are
//!   expected outcomes of the ring protocol. Callers treat them as flow
//!   control, the service logs them and continues.
//! - **Session-fatal errors** (`DeviceNotFound`, `InitFailed`,
//!   `CreationFailed`, `Configuration`) abort the current call but leave the
//!   process intact; the service falls back to its previous lifecycle state.
//! - **Contract violations** (`InvalidArgument`, `InvalidSize`,
//!   `InvalidHandle`) indicate caller bugs and map directly onto the flat
//!   status codes of the C ABI.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, ImagingError>;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Ring buffer is full")]
    BufferFull,

    #[error("Ring buffer is empty")]
    BufferEmpty,

    #[error("Operation timed out")]
    Timeout,

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Feature '{0}' is not supported by this device")]
    FeatureNotSupported(String),

    #[error("Creation failed: {0}")]
    CreationFailed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device initialization failed: {0}")]
    InitFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImagingError {
    /// True for the ring-protocol statuses that callers treat as flow
    /// control rather than failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImagingError::BufferFull | ImagingError::BufferEmpty | ImagingError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ImagingError::DeviceNotFound("decklink_0".to_string());
        assert_eq!(err.to_string(), "Device not found: decklink_0");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ImagingError::BufferFull.is_transient());
        assert!(ImagingError::Timeout.is_transient());
        assert!(!ImagingError::NotInitialized.is_transient());
        assert!(!ImagingError::InvalidSize("x".into()).is_transient());
    }
}
