//! odin-core: download-mode flashing protocol implementation.
//!
//! Talks the vendor bulk-USB download protocol ("ODIN") used by devices
//! in download mode: session handshake, framed packet exchange, PIT
//! partition-table parsing, and chunked partition read/write/erase.
//! When the external authoritative flashing tool is installed it is
//! preferred for every operation; the raw protocol is the fallback
//! path, gated behind an explicit force flag for destructive or
//! unverified work.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: wire constants and packet framing
//! - **Transport**: bulk-USB abstraction (nusb, mock)
//! - **PIT**: partition-table parsing and the partition catalog
//! - **Session**: handshake state machine and framed exchange
//! - **Transfer**: chunked read / write / erase engine
//! - **Tool**: external authoritative tool invocation
//! - **Client**: tool-first orchestration with raw-protocol fallback
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use odin_core::client::{ClientConfig, OdinClient};
//!
//! let config = ClientConfig::default();
//! let mut client = OdinClient::discover(&config).expect("no device");
//! client.connect().expect("handshake failed");
//! for (name, part) in client.detect_partition_layout(None) {
//!     println!("{name}: {:?}", part.length);
//! }
//! client.disconnect();
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod pit;
pub mod protocol;
pub mod session;
pub mod tool;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientConfig, OdinClient};
pub use error::{OdinError, ProtocolError};
pub use events::{FlashEvent, FlashObserver, NullObserver, TracingObserver};
pub use pit::{Partition, PartitionCatalog, PitParser};
pub use protocol::OdinCommand;
pub use session::DeviceSession;
pub use tool::{HeimdallTool, ToolError};
pub use transfer::TransferEngine;
pub use transport::{BulkTransport, MockTransport, NusbTransport, TransportError};
