//! Download-mode device session.
//!
//! Owns the handshake state machine and the framed packet exchange.
//! A session is the sole holder of the "established" invariant: packet
//! exchanges fail immediately unless a handshake has succeeded, and the
//! transfer operations name `ensure_established` as an explicit
//! precondition step rather than handshaking as a side effect.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{OdinError, ProtocolError, Result};
use crate::protocol::constants::{
    DEFAULT_PACKET_TIMEOUT, HANDSHAKE_MAGIC, HANDSHAKE_READ_TIMEOUT, HANDSHAKE_REPLY_MAGIC,
    HANDSHAKE_RETRY_DELAY, HANDSHAKE_WRITE_TIMEOUT, PAYLOAD_CHUNK_SIZE, PIT_CHUNK_SIZE,
    PIT_MAX_BYTES, PIT_READ_TIMEOUT, PROBE_READ_TIMEOUT, PROBE_WRITE_TIMEOUT, SESSION_END_TIMEOUT,
};
use crate::protocol::packet::{self, OdinCommand};
use crate::transport::{BulkTransport, NusbTransport, TransportError};

/// Default handshake attempt count.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

/// A claimed download-mode device plus its protocol session state.
pub struct DeviceSession<T: BulkTransport> {
    transport: Option<T>,
    session_established: bool,
    packet_timeout: Duration,
}

impl DeviceSession<NusbTransport> {
    /// Find a download-mode device and wrap it in a (not yet established)
    /// session.
    pub fn discover() -> Result<Self> {
        Ok(Self::new(find_transport()?))
    }
}

impl<T: BulkTransport> DeviceSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Some(transport),
            session_established: false,
            packet_timeout: DEFAULT_PACKET_TIMEOUT,
        }
    }

    pub fn is_established(&self) -> bool {
        self.session_established
    }

    pub fn vendor_id(&self) -> Option<u16> {
        self.transport.as_ref().map(|t| t.vendor_id())
    }

    pub fn product_id(&self) -> Option<u16> {
        self.transport.as_ref().map(|t| t.product_id())
    }

    fn transport(&self) -> Result<&T> {
        self.transport
            .as_ref()
            .ok_or_else(|| OdinError::Connection("not connected".into()))
    }

    /// Perform the handshake exchange, retrying up to `attempts` times.
    ///
    /// Sends the 4-byte host magic and accepts any reply prefixed by the
    /// expected reply magic. Mismatch or timeout pauses briefly and
    /// retries; exhausting every attempt is a handshake error.
    #[instrument(skip(self))]
    pub fn establish(&mut self, attempts: u32) -> Result<()> {
        for attempt in 1..=attempts {
            debug!(attempt, attempts, "session handshake");
            let outcome = {
                let transport = self.transport()?;
                transport
                    .write(HANDSHAKE_MAGIC, HANDSHAKE_WRITE_TIMEOUT)
                    .and_then(|_| transport.read(16, HANDSHAKE_READ_TIMEOUT))
            };
            match outcome {
                Ok(reply) if reply.starts_with(HANDSHAKE_REPLY_MAGIC) => {
                    self.session_established = true;
                    info!("session established");
                    return Ok(());
                }
                Ok(reply) => {
                    warn!(reply = %hex::encode(&reply), "unexpected handshake reply");
                }
                Err(e) => {
                    warn!(error = %e, "handshake attempt failed");
                }
            }
            if attempt < attempts {
                thread::sleep(HANDSHAKE_RETRY_DELAY);
            }
        }
        Err(OdinError::Handshake { attempts })
    }

    /// Establish with the default attempt count unless already established.
    pub fn ensure_established(&mut self) -> Result<()> {
        if self.session_established {
            return Ok(());
        }
        self.establish(HANDSHAKE_ATTEMPTS)
    }

    /// Send a framed packet. Requires an established session.
    pub fn send_packet(&self, command: OdinCommand, payload: &[u8]) -> Result<()> {
        if !self.session_established {
            return Err(ProtocolError::SessionNotEstablished.into());
        }
        let frame = packet::encode(command, payload);
        self.transport()?.write(&frame, self.packet_timeout)?;
        Ok(())
    }

    /// Receive a framed packet, reassembling the payload in chunks.
    /// Requires an established session.
    pub fn receive_packet(&self, timeout: Duration) -> Result<(u8, Vec<u8>)> {
        if !self.session_established {
            return Err(ProtocolError::SessionNotEstablished.into());
        }
        let transport = self.transport()?;

        let header = transport.read(packet::HEADER_SIZE, timeout)?;
        let (command, length) = packet::decode_header(&header)?;

        let mut payload = Vec::with_capacity(length as usize);
        while payload.len() < length as usize {
            let want = (length as usize - payload.len()).min(PAYLOAD_CHUNK_SIZE);
            let chunk = transport.read(want, timeout)?;
            if chunk.is_empty() {
                return Err(ProtocolError::Framing {
                    expected: length as usize,
                    actual: payload.len(),
                }
                .into());
            }
            payload.extend_from_slice(&chunk);
        }

        Ok((command, payload))
    }

    /// Fetch the raw PIT over the protocol.
    ///
    /// Sends GET_PIT and drains the bulk IN endpoint in fixed-size chunks
    /// until a short read or a timeout with data already received. A
    /// timeout before any data is an error; so is exceeding the PIT cap.
    pub fn download_pit(&mut self) -> Result<Vec<u8>> {
        self.ensure_established()?;
        self.send_packet(OdinCommand::GetPit, &[])?;

        let transport = self.transport()?;
        let mut data = Vec::new();
        while data.len() < PIT_MAX_BYTES {
            match transport.read(PIT_CHUNK_SIZE, PIT_READ_TIMEOUT) {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        break;
                    }
                    let short = chunk.len() < PIT_CHUNK_SIZE;
                    data.extend_from_slice(&chunk);
                    if short {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e.into()),
            }
        }

        if data.is_empty() {
            return Err(ProtocolError::EmptyResponse {
                operation: "PIT download",
            }
            .into());
        }
        info!(bytes = data.len(), "PIT downloaded");
        Ok(data)
    }

    /// Send the single-byte session-end command.
    ///
    /// Never errors: the session is being torn down regardless, so
    /// failures are logged and swallowed.
    pub fn end_session(&mut self) {
        if !self.session_established {
            return;
        }
        if let Some(transport) = self.transport.as_ref() {
            if let Err(e) = transport.write(&[OdinCommand::SessionEnd.as_u8()], SESSION_END_TIMEOUT)
            {
                warn!(error = %e, "session end failed");
            }
        }
        self.session_established = false;
    }

    /// Tear the session down: best-effort session end, best-effort
    /// interface release (with kernel-driver reattach where owed), then
    /// unconditional local state reset.
    ///
    /// Idempotent; safe on a session that never connected.
    pub fn disconnect(&mut self) {
        self.end_session();
        if let Some(mut transport) = self.transport.take() {
            transport.release();
        }
        self.session_established = false;
    }
}

/// Throwaway handshake used to decide whether an unrecognized same-vendor
/// device is actually in download mode.
pub fn probe_download_mode<T: BulkTransport>(transport: &T) -> bool {
    if transport
        .write(HANDSHAKE_MAGIC, PROBE_WRITE_TIMEOUT)
        .is_err()
    {
        return false;
    }
    match transport.read(8, PROBE_READ_TIMEOUT) {
        Ok(reply) => reply.starts_with(HANDSHAKE_REPLY_MAGIC),
        Err(_) => false,
    }
}

/// Locate a download-mode device.
///
/// Known product ids are authoritative; when none match, every remaining
/// same-vendor device is probed with a throwaway handshake, since not all
/// bootloader revisions expose a known product id.
pub fn find_transport() -> Result<NusbTransport> {
    match NusbTransport::open() {
        Ok(t) => return Ok(t),
        Err(TransportError::DeviceNotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    debug!("no known product id matched, probing same-vendor devices");
    for mut candidate in NusbTransport::open_vendor_candidates() {
        if probe_download_mode(&candidate) {
            info!(
                pid = %format!("{:04X}", candidate.product_id()),
                "unlisted device answered the download-mode probe"
            );
            return Ok(candidate);
        }
        candidate.release();
    }

    Err(OdinError::Connection(
        "no device in download mode found".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn established_session(mock_setup: impl Fn(&MockTransport)) -> DeviceSession<MockTransport> {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE\x00\x00\x00\x00");
        mock_setup(&mock);
        let mut session = DeviceSession::new(mock);
        session.establish(1).unwrap();
        session
    }

    #[test]
    fn test_handshake_success_on_second_attempt() {
        let mock = MockTransport::new();
        mock.queue_response(b"NOPE");
        mock.queue_response(b"LOKE\x01\x02");

        let mut session = DeviceSession::new(mock);
        session.establish(3).unwrap();
        assert!(session.is_established());
    }

    #[test]
    fn test_handshake_stops_after_success() {
        let mock = MockTransport::new();
        mock.queue_response(b"NOPE");
        mock.queue_response(b"LOKE");

        let mut session = DeviceSession::new(mock);
        session.establish(3).unwrap();

        // Two attempts, two magic writes; a third attempt never happens.
        let writes = session.transport().unwrap().writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], HANDSHAKE_MAGIC);
        assert_eq!(writes[1], HANDSHAKE_MAGIC);
    }

    #[test]
    fn test_handshake_exhaustion_raises_handshake_error() {
        let mock = MockTransport::new();
        mock.queue_response(b"XXXX");
        mock.queue_response(b"YYYY");
        mock.queue_response(b"ZZZZ");

        let mut session = DeviceSession::new(mock);
        let err = session.establish(3).unwrap_err();
        assert!(matches!(err, OdinError::Handshake { attempts: 3 }));
        assert!(!session.is_established());

        let writes = session.transport().unwrap().writes();
        assert_eq!(writes.len(), 3);
    }

    #[test]
    fn test_packet_exchange_requires_established_session() {
        let session = DeviceSession::new(MockTransport::new());

        let err = session
            .send_packet(OdinCommand::GetPit, &[])
            .unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::SessionNotEstablished)
        ));

        let err = session.receive_packet(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::SessionNotEstablished)
        ));
    }

    #[test]
    fn test_receive_packet_reassembles_payload() {
        let session = established_session(|mock| {
            mock.queue_packet(OdinCommand::FileTransfer, &[0xAB; 9000]);
        });

        let (cmd, payload) = session.receive_packet(Duration::from_secs(1)).unwrap();
        assert_eq!(cmd, OdinCommand::FileTransfer.as_u8());
        assert_eq!(payload.len(), 9000);
        assert!(payload.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_receive_packet_short_header_is_framing_error() {
        let session = established_session(|mock| {
            mock.queue_response(&[0x67, 0x00]);
        });

        let err = session.receive_packet(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::Framing { .. })
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut session = DeviceSession::new(MockTransport::new());
        session.disconnect();
        session.disconnect();
        assert!(!session.is_established());
        assert!(session.transport.is_none());
    }

    #[test]
    fn test_disconnect_clears_established_session() {
        let mut session = established_session(|_| {});
        assert!(session.is_established());

        session.disconnect();
        assert!(!session.is_established());

        session.disconnect();
        assert!(!session.is_established());
    }

    #[test]
    fn test_end_session_swallows_transport_failure() {
        let session_mock = MockTransport::new();
        session_mock.queue_response(b"LOKE");
        let mut session = DeviceSession::new(session_mock);
        session.establish(1).unwrap();

        session.transport().unwrap().simulate_disconnect();
        session.end_session();
        assert!(!session.is_established());
    }

    #[test]
    fn test_download_pit_returns_short_read() {
        let mut session = established_session(|mock| {
            mock.queue_response(&[0x42; 100]);
        });

        let data = session.download_pit().unwrap();
        assert_eq!(data.len(), 100);

        // GET_PIT went out as a framed packet with an empty payload.
        let writes = session.transport().unwrap().writes();
        assert_eq!(writes.last().unwrap(), &packet::encode(OdinCommand::GetPit, &[]));
    }

    #[test]
    fn test_download_pit_without_data_is_error() {
        let mut session = established_session(|_| {});

        let err = session.download_pit().unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::EmptyResponse { .. })
        ));
    }

    #[test]
    fn test_probe_accepts_reply_magic_prefix() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE\x01\x02\x03\x04");
        assert!(probe_download_mode(&mock));

        let mock = MockTransport::new();
        mock.queue_response(b"EKOL");
        assert!(!probe_download_mode(&mock));

        // No reply at all is not download mode either.
        let mock = MockTransport::new();
        assert!(!probe_download_mode(&mock));
    }
}
