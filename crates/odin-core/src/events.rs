//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI subscribe to lifecycle and progress events without
//! tight coupling to the protocol logic.

/// Events emitted by the client and transfer engine.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Device located and claimed.
    DeviceConnected { vid: u16, pid: u16 },
    /// Device released.
    DeviceDisconnected,
    /// Protocol handshake succeeded.
    SessionEstablished,
    /// External tool failed or is absent; raw protocol takes over.
    ToolFallback {
        operation: &'static str,
        reason: String,
    },
    /// Progress update for a chunked transfer. `total` is 0 when the
    /// expected size is unknown.
    Progress {
        operation: &'static str,
        current: u64,
        total: u64,
    },
    /// A transfer finished.
    TransferComplete { operation: &'static str, bytes: u64 },
}

/// Observer trait for receiving client events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid } => {
                tracing::info!(
                    vid = %format!("{vid:04X}"),
                    pid = %format!("{pid:04X}"),
                    "device connected"
                );
            }
            FlashEvent::DeviceDisconnected => {
                tracing::info!("device disconnected");
            }
            FlashEvent::SessionEstablished => {
                tracing::info!("session established");
            }
            FlashEvent::ToolFallback { operation, reason } => {
                tracing::warn!(
                    operation,
                    reason = %reason,
                    "external tool unavailable, falling back to raw protocol"
                );
            }
            FlashEvent::Progress {
                operation,
                current,
                total,
            } => {
                if *total > 0 {
                    let pct = (*current * 100) / *total;
                    tracing::debug!(operation, progress = %format!("{pct}%"), "progress");
                } else {
                    tracing::debug!(operation, bytes = current, "progress");
                }
            }
            FlashEvent::TransferComplete { operation, bytes } => {
                tracing::info!(operation, bytes, "transfer complete");
            }
        }
    }
}
