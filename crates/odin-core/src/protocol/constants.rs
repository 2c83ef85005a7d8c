//! Protocol constants for the ODIN download-mode wire protocol.
//!
//! Command codes and magics are a contract between host and device
//! firmware; they must match the target device family.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Samsung Electronics Vendor ID
pub const SAMSUNG_VENDOR_ID: u16 = 0x04E8;

/// Product IDs known to correspond to download-mode devices.
///
/// Not exhaustive: some bootloader revisions enumerate with other PIDs,
/// which is why discovery falls back to a handshake probe of any
/// same-vendor device.
pub const ODIN_MODE_PIDS: &[u16] = &[0x685D, 0x6860, 0x6861, 0x6863, 0x6864, 0x6866, 0x7000];

// ============================================================================
// Handshake Magics
// ============================================================================

/// 4-byte magic sent by the host to open a session.
pub const HANDSHAKE_MAGIC: &[u8; 4] = b"ODIN";

/// 4-byte magic prefixing the device's handshake reply.
pub const HANDSHAKE_REPLY_MAGIC: &[u8; 4] = b"LOKE";

// ============================================================================
// Size Constants
// ============================================================================

/// Chunk size for receiving framed packet payloads.
pub const PAYLOAD_CHUNK_SIZE: usize = 4 * 1024;

/// Chunk size for streaming file data to the device.
pub const WRITE_CHUNK_SIZE: usize = 128 * 1024;

/// Chunk size for the raw PIT download loop.
pub const PIT_CHUNK_SIZE: usize = 4 * 1024;

/// Upper bound on a downloaded PIT.
pub const PIT_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Safety ceiling for a partition read; a stream past this point is
/// treated as runaway and aborted.
pub const MAX_READ_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Sentinel identifier for a partition with no known protocol id.
/// Never 0: the device decides whether an id is valid, the host does not.
pub const UNKNOWN_PARTITION_ID: u32 = 0xFFFF_FFFF;

// ============================================================================
// Timeouts
// ============================================================================

pub const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Timeouts for the throwaway handshake used while probing unrecognized
/// same-vendor devices.
pub const PROBE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for outbound packet writes.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-packet timeout inside the read loop.
pub const READ_PACKET_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the (unreliable) write acknowledgment.
pub const WRITE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Erase completion timeout; erase of a large partition is slow.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(60);

pub const PIT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const SESSION_END_TIMEOUT: Duration = Duration::from_secs(2);
