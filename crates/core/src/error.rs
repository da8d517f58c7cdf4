//! Error types for lgstray-core.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HID device communication failure.
    #[error("HID error: {0}")]
    Hid(String),

    /// Device not found during enumeration or open.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The handle was closed while a request was in flight.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// HID++ protocol error (device returned error code).
    #[error("HID++ error: feature 0x{feature:04X}, code {code}")]
    HidppProtocol { feature: u16, code: u8 },

    /// Reply did not have the expected shape.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Feature is outside the telemetry allow-list.
    #[error("feature 0x{0:04X} is not allowed")]
    FeatureNotAllowed(u16),

    /// Settings could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// Shared-memory region could not be created or mapped.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Inter-process channel failure.
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
