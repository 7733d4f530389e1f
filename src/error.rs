//! Error types for devio.

use thiserror::Error;

/// Result type alias using devio's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a virtual disk.
#[derive(Error, Debug)]
pub enum Error {
    // Setup errors
    #[error("object name already in use: {0}")]
    NameInUse(String),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("driver not reachable: {0}")]
    DriverUnreachable(String),

    #[error("insufficient privileges: {0}")]
    PermissionDenied(String),

    // Provider errors
    #[error("access outside provider extent: offset {offset}, length {length}")]
    OutOfRange { offset: i64, length: u64 },

    #[error("provider is read-only")]
    ReadOnly,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("provider is closed")]
    ProviderClosed,

    // Protocol errors
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown request code: 0x{0:x}")]
    UnknownRequest(u64),

    // Lifecycle errors
    #[error("service not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("service did not signal readiness within {0:?}")]
    StartTimeout(std::time::Duration),

    #[error("service failed to initialize: {0}")]
    InitFailed(String),

    #[error("service worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("service is not serving")]
    NotServing,

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Control plane errors
    #[error("control plane error: {0}")]
    Control(#[from] ControlError),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Platform-specific errors
    #[cfg(target_os = "windows")]
    #[error("Windows error: {0}")]
    Windows(#[from] windows::core::Error),
}

impl Error {
    /// Create a protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }
}

/// Errors reported by the driver control plane.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The device is busy; the caller may retry.
    #[error("access denied")]
    AccessDenied,

    /// The device does not exist (or no longer exists).
    #[error("device not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}
