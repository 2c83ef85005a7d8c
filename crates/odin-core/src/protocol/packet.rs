//! Packet framing for the ODIN bulk channel.
//!
//! Every framed exchange is a 5-byte header (1-byte command + 4-byte
//! little-endian payload length) followed by exactly `length` payload
//! bytes. There is no padding and no checksum at this layer; content
//! integrity is the caller's concern.

use std::fmt;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::ProtocolError;

/// On-the-wire header size.
pub const HEADER_SIZE: usize = 5;

/// Command codes understood by download-mode firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OdinCommand {
    SessionStart = 0x65,
    SessionEnd = 0x66,
    FileTransfer = 0x67,
    FileComplete = 0x68,
    GetPit = 0x69,
    PartitionInfo = 0x70,
    ErasePartition = 0x71,
    Reboot = 0x72,
}

impl OdinCommand {
    /// Map a raw command byte back to a known command, if any.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x65 => Some(Self::SessionStart),
            0x66 => Some(Self::SessionEnd),
            0x67 => Some(Self::FileTransfer),
            0x68 => Some(Self::FileComplete),
            0x69 => Some(Self::GetPit),
            0x70 => Some(Self::PartitionInfo),
            0x71 => Some(Self::ErasePartition),
            0x72 => Some(Self::Reboot),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OdinCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OdinCommand::SessionStart => "SESSION_START",
            OdinCommand::SessionEnd => "SESSION_END",
            OdinCommand::FileTransfer => "FILE_TRANSFER",
            OdinCommand::FileComplete => "FILE_COMPLETE",
            OdinCommand::GetPit => "GET_PIT",
            OdinCommand::PartitionInfo => "PARTITION_INFO",
            OdinCommand::ErasePartition => "ERASE_PARTITION",
            OdinCommand::Reboot => "REBOOT",
        };
        write!(f, "{name}")
    }
}

/// Encode a command and payload into a framed packet.
pub fn encode(command: OdinCommand, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.write_u8(command.as_u8()).unwrap();
    buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Decode a packet header into its raw command byte and payload length.
///
/// Fewer than [`HEADER_SIZE`] bytes is a framing error, never padded out.
pub fn decode_header(bytes: &[u8]) -> Result<(u8, u32), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Framing {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let command = bytes[0];
    let length = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((command, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let pkt = encode(OdinCommand::FileTransfer, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(pkt.len(), HEADER_SIZE + 3);
        assert_eq!(pkt[0], 0x67);
        // length is little-endian
        assert_eq!(&pkt[1..5], &[3, 0, 0, 0]);
        assert_eq!(&pkt[5..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_encode_empty_payload() {
        let pkt = encode(OdinCommand::FileComplete, &[]);
        assert_eq!(pkt, vec![0x68, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_header_roundtrip() {
        let pkt = encode(OdinCommand::GetPit, &[1, 2, 3, 4]);
        let (cmd, len) = decode_header(&pkt).unwrap();
        assert_eq!(cmd, OdinCommand::GetPit.as_u8());
        assert_eq!(len, 4);
    }

    #[test]
    fn test_decode_short_header_is_framing_error() {
        let err = decode_header(&[0x67, 0x01, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Framing {
                expected: HEADER_SIZE,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_command_from_raw() {
        assert_eq!(OdinCommand::from_raw(0x68), Some(OdinCommand::FileComplete));
        assert_eq!(OdinCommand::from_raw(0x00), None);
        assert_eq!(OdinCommand::from_raw(0xFF), None);
    }
}
