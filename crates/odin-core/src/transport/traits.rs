//! Bulk transport abstraction.
//!
//! Defines the `BulkTransport` trait the protocol layers depend on,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no device found: VID={vid:04X}")]
    DeviceNotFound { vid: u16 },

    #[error("failed to open device: {0}")]
    OpenFailed(String),

    #[error("failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("no interface exposing bulk IN and bulk OUT endpoints")]
    EndpointNotFound,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl TransportError {
    /// Timeouts get special handling in the transfer loops (implicit
    /// completion on read, optimistic acknowledgment on write).
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract synchronous bulk transport.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait BulkTransport: Send + Sync {
    /// Write raw bytes to the bulk OUT endpoint.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read up to `max_len` raw bytes from the bulk IN endpoint.
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the interface claim and reattach the kernel driver if this
    /// transport detached it. Must be idempotent.
    fn release(&mut self);

    /// Check if the device is still reachable.
    fn is_connected(&self) -> bool;

    /// Vendor ID of the attached device.
    fn vendor_id(&self) -> u16;

    /// Product ID of the attached device.
    fn product_id(&self) -> u16;
}
