//! Error taxonomy for the flashing client.
//!
//! External-tool failures never appear here: they are absorbed by the
//! orchestrator and converted into a fallback to the next strategy.

use thiserror::Error;

use crate::transport::TransportError;

/// Violations of the framed packet exchange.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("short packet: got {actual} of {expected} bytes")]
    Framing { expected: usize, actual: usize },

    #[error("unexpected command in response: got 0x{got:02X}, expected 0x{expected:02X}")]
    UnexpectedCommand { expected: u8, got: u8 },

    #[error("session not established")]
    SessionNotEstablished,

    #[error("no data received for {operation}")]
    EmptyResponse { operation: &'static str },

    #[error("transfer exceeded the {limit}-byte safety ceiling")]
    OversizedStream { limit: u64 },
}

#[derive(Error, Debug)]
pub enum OdinError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("handshake failed after {attempts} attempts (is the device in download mode?)")]
    Handshake { attempts: u32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("partition '{name}' not found in detected layout")]
    NotFound { name: String },

    #[error("refusing unsafe operation: {0}")]
    SafetyGate(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OdinError>;
