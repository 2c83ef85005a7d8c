//! Chunked partition transfer operations.
//!
//! Read, write and erase over an established session. The orchestrator
//! in [`crate::client`] decides when these raw-protocol paths run; the
//! engine itself enforces the streaming limits, progress accounting and
//! partial-artifact cleanup.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::error::{OdinError, ProtocolError, Result};
use crate::events::{FlashEvent, FlashObserver};
use crate::pit::{PartitionCatalog, PitParser};
use crate::protocol::constants::{
    ERASE_TIMEOUT, MAX_READ_BYTES, READ_PACKET_TIMEOUT, WRITE_ACK_TIMEOUT, WRITE_CHUNK_SIZE,
};
use crate::protocol::packet::OdinCommand;
use crate::session::DeviceSession;
use crate::tool::HeimdallTool;
use crate::transport::BulkTransport;

/// Chunked read/write/erase over a device session.
pub struct TransferEngine<'a, T: BulkTransport, O: FlashObserver> {
    session: &'a mut DeviceSession<T>,
    catalog: &'a mut PartitionCatalog,
    parser: &'a PitParser,
    tool: Option<&'a HeimdallTool>,
    observer: &'a O,
    /// Runaway-stream ceiling for reads; overridden in tests.
    pub(crate) max_read_bytes: u64,
}

impl<'a, T: BulkTransport, O: FlashObserver> TransferEngine<'a, T, O> {
    pub fn new(
        session: &'a mut DeviceSession<T>,
        catalog: &'a mut PartitionCatalog,
        parser: &'a PitParser,
        tool: Option<&'a HeimdallTool>,
        observer: &'a O,
    ) -> Self {
        Self {
            session,
            catalog,
            parser,
            tool,
            observer,
            max_read_bytes: MAX_READ_BYTES,
        }
    }

    /// Resolve a name that must exist in the layout.
    ///
    /// Triggers layout detection when the name is unknown; a name still
    /// absent afterwards is a definitive not-found error.
    fn resolve_required(&mut self, name: &str) -> Result<u32> {
        if self.catalog.get(name).is_none() {
            self.catalog
                .detect_layout(self.parser, self.tool, None, self.session);
        }
        if self.catalog.get(name).is_none() {
            return Err(OdinError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(self.catalog.guess_identifier(name))
    }

    /// Resolve a name best-effort: a partially parsed PIT can omit valid
    /// identifiers, so an absent name only warns and the guess is sent
    /// anyway for the device to accept or reject.
    fn resolve_lenient(&mut self, name: &str) -> u32 {
        if self.catalog.get(name).is_none() {
            self.catalog
                .detect_layout(self.parser, self.tool, None, self.session);
        }
        if self.catalog.get(name).is_none() {
            warn!(
                partition = name,
                "not present in the detected layout, sending identifier guess anyway"
            );
        }
        self.catalog.guess_identifier(name)
    }

    /// Read a partition into `output`.
    ///
    /// All-or-nothing: on any failure the partially written file is
    /// removed before the error propagates.
    #[instrument(skip(self, output), fields(output = %output.display()))]
    pub fn read_partition(&mut self, name: &str, output: &Path) -> Result<u64> {
        let id = self.resolve_required(name)?;
        let expected = self.catalog.get(name).and_then(|p| p.length).unwrap_or(0);
        self.session.ensure_established()?;

        info!(partition = name, id = %format!("{id:#010X}"), "reading partition");
        let result = self.read_stream(id, expected, output);
        if result.is_err() && output.exists() {
            let _ = fs::remove_file(output);
        }
        result
    }

    fn read_stream(&mut self, id: u32, expected: u64, output: &Path) -> Result<u64> {
        self.session
            .send_packet(OdinCommand::FileTransfer, &id.to_le_bytes())?;

        let mut file = File::create(output)?;
        let mut total: u64 = 0;

        loop {
            match self.session.receive_packet(READ_PACKET_TIMEOUT) {
                Ok((cmd, payload)) => match OdinCommand::from_raw(cmd) {
                    Some(OdinCommand::FileComplete) => {
                        file.flush()?;
                        info!(bytes = total, "read complete");
                        self.observer.on_event(&FlashEvent::TransferComplete {
                            operation: "read",
                            bytes: total,
                        });
                        return Ok(total);
                    }
                    Some(OdinCommand::FileTransfer) => {
                        file.write_all(&payload)?;
                        total += payload.len() as u64;
                        self.observer.on_event(&FlashEvent::Progress {
                            operation: "read",
                            current: total,
                            total: expected,
                        });
                        if total > self.max_read_bytes {
                            return Err(ProtocolError::OversizedStream {
                                limit: self.max_read_bytes,
                            }
                            .into());
                        }
                    }
                    _ => {
                        return Err(ProtocolError::UnexpectedCommand {
                            expected: OdinCommand::FileTransfer.as_u8(),
                            got: cmd,
                        }
                        .into());
                    }
                },
                Err(OdinError::Transport(e)) if e.is_timeout() => {
                    if total > 0 {
                        // Devices do not always send an explicit terminator.
                        file.flush()?;
                        warn!(bytes = total, "read timed out after data, treating stream as complete");
                        self.observer.on_event(&FlashEvent::TransferComplete {
                            operation: "read",
                            bytes: total,
                        });
                        return Ok(total);
                    }
                    return Err(OdinError::Transport(e));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream a file to a partition.
    ///
    /// The force gate lives in the orchestrator; by the time this runs the
    /// caller has accepted the unverified raw path. A missing acknowledgment
    /// is logged and treated as success: this protocol layer offers no
    /// reliable device-side confirmation.
    #[instrument(skip(self, input), fields(input = %input.display()))]
    pub fn write_partition(&mut self, name: &str, input: &Path) -> Result<u64> {
        let file_size = fs::metadata(input)?.len();
        if file_size == 0 {
            return Err(OdinError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "input file is empty",
            )));
        }
        if file_size > u64::from(u32::MAX) {
            return Err(OdinError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "input file exceeds the 4 GiB wire limit",
            )));
        }

        let id = self.resolve_lenient(name);
        self.session.ensure_established()?;

        let digest = file_digest(input)?;
        info!(
            partition = name,
            id = %format!("{id:#010X}"),
            bytes = file_size,
            sha256 = %digest,
            "flashing file"
        );

        let mut header = Vec::with_capacity(8);
        header.write_u32::<LittleEndian>(id).unwrap();
        header.write_u32::<LittleEndian>(file_size as u32).unwrap();
        self.session
            .send_packet(OdinCommand::PartitionInfo, &header)?;

        let mut file = File::open(input)?;
        let mut buf = vec![0u8; WRITE_CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.session
                .send_packet(OdinCommand::FileTransfer, &buf[..n])?;
            sent += n as u64;
            self.observer.on_event(&FlashEvent::Progress {
                operation: "write",
                current: sent,
                total: file_size,
            });
        }
        self.session.send_packet(OdinCommand::FileComplete, &[])?;

        match self.session.receive_packet(WRITE_ACK_TIMEOUT) {
            Ok((cmd, _)) if OdinCommand::from_raw(cmd) == Some(OdinCommand::FileComplete) => {
                info!(bytes = sent, "write acknowledged");
                self.observer.on_event(&FlashEvent::TransferComplete {
                    operation: "write",
                    bytes: sent,
                });
                Ok(sent)
            }
            Ok((cmd, _)) => Err(ProtocolError::UnexpectedCommand {
                expected: OdinCommand::FileComplete.as_u8(),
                got: cmd,
            }
            .into()),
            Err(OdinError::Transport(e)) if e.is_timeout() => {
                warn!(
                    bytes = sent,
                    "no acknowledgment before timeout; write is unverified, assuming success"
                );
                self.observer.on_event(&FlashEvent::TransferComplete {
                    operation: "write",
                    bytes: sent,
                });
                Ok(sent)
            }
            Err(e) => Err(e),
        }
    }

    /// Erase a partition.
    ///
    /// Unlike read, a completion timeout here is a failure: success is
    /// never assumed for a destructive operation.
    #[instrument(skip(self))]
    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        let id = self.resolve_lenient(name);
        self.session.ensure_established()?;

        info!(partition = name, id = %format!("{id:#010X}"), "erasing partition");
        self.session
            .send_packet(OdinCommand::ErasePartition, &id.to_le_bytes())?;

        match self.session.receive_packet(ERASE_TIMEOUT) {
            Ok((cmd, _)) if OdinCommand::from_raw(cmd) == Some(OdinCommand::FileComplete) => {
                info!(partition = name, "erase complete");
                Ok(())
            }
            Ok((cmd, _)) => Err(ProtocolError::UnexpectedCommand {
                expected: OdinCommand::FileComplete.as_u8(),
                got: cmd,
            }
            .into()),
            Err(e) => Err(e),
        }
    }
}

/// Streaming SHA-256 of a file, hex-encoded.
///
/// Informational only: the protocol provides no device-side verification
/// to check it against.
fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::pit::Partition;
    use crate::protocol::packet;
    use crate::transport::MockTransport;

    struct Fixture {
        mock: MockTransport,
        session: DeviceSession<MockTransport>,
        catalog: PartitionCatalog,
        parser: PitParser,
    }

    impl Fixture {
        /// Session pre-armed with a handshake reply; catalog pre-installed
        /// so resolution never goes out to the device.
        fn new() -> Self {
            let mock = MockTransport::new();
            mock.queue_response(b"LOKE");
            let mut part = Partition::named("boot");
            part.id = Some(1);
            part.length = Some(64);
            let mut catalog = PartitionCatalog::new();
            catalog.install(vec![part]);
            Self {
                session: DeviceSession::new(mock.clone()),
                mock,
                catalog,
                parser: PitParser::new(),
            }
        }

        fn engine<'a>(&'a mut self, observer: &'a NullObserver) -> TransferEngine<'a, MockTransport, NullObserver> {
            TransferEngine::new(
                &mut self.session,
                &mut self.catalog,
                &self.parser,
                None,
                observer,
            )
        }

        fn queue_packet(&self, command: OdinCommand, payload: &[u8]) {
            self.mock.queue_packet(command, payload);
        }
    }

    fn out_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_read_collects_chunks_until_complete() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        fx.queue_packet(OdinCommand::FileTransfer, &[1, 2, 3]);
        fx.queue_packet(OdinCommand::FileTransfer, &[4, 5]);
        fx.queue_packet(OdinCommand::FileComplete, &[]);

        let dir = tempfile::tempdir().unwrap();
        let output = out_path(&dir, "boot.img");
        let total = fx.engine(&observer).read_partition("boot", &output).unwrap();

        assert_eq!(total, 5);
        assert_eq!(fs::read(&output).unwrap(), vec![1, 2, 3, 4, 5]);

        // The request carried the resolved identifier, little-endian.
        let writes = fx.mock.writes();
        assert_eq!(
            writes.last().unwrap(),
            &packet::encode(OdinCommand::FileTransfer, &1u32.to_le_bytes())
        );
    }

    #[test]
    fn test_read_timeout_after_data_is_implicit_complete() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        fx.queue_packet(OdinCommand::FileTransfer, &[9; 10]);
        // No completion packet queued: next receive times out.

        let dir = tempfile::tempdir().unwrap();
        let output = out_path(&dir, "boot.img");
        let total = fx.engine(&observer).read_partition("boot", &output).unwrap();

        assert_eq!(total, 10);
        assert_eq!(fs::read(&output).unwrap().len(), 10);
    }

    #[test]
    fn test_read_timeout_without_data_fails_and_cleans_up() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        // Nothing queued after the handshake: immediate timeout.

        let dir = tempfile::tempdir().unwrap();
        let output = out_path(&dir, "boot.img");
        let err = fx
            .engine(&observer)
            .read_partition("boot", &output)
            .unwrap_err();

        assert!(matches!(err, OdinError::Transport(e) if e.is_timeout()));
        assert!(!output.exists());
    }

    #[test]
    fn test_read_unexpected_command_fails_and_cleans_up() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        fx.queue_packet(OdinCommand::FileTransfer, &[7; 4]);
        fx.queue_packet(OdinCommand::ErasePartition, &[]);

        let dir = tempfile::tempdir().unwrap();
        let output = out_path(&dir, "boot.img");
        let err = fx
            .engine(&observer)
            .read_partition("boot", &output)
            .unwrap_err();

        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::UnexpectedCommand { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_read_enforces_safety_ceiling() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        fx.queue_packet(OdinCommand::FileTransfer, &[0; 32]);
        fx.queue_packet(OdinCommand::FileTransfer, &[0; 32]);

        let dir = tempfile::tempdir().unwrap();
        let output = out_path(&dir, "boot.img");
        let mut engine = fx.engine(&observer);
        engine.max_read_bytes = 48;
        let err = engine.read_partition("boot", &output).unwrap_err();

        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::OversizedStream { limit: 48 })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_read_unknown_partition_is_not_found() {
        let observer = NullObserver;
        let mut fx = Fixture::new();

        let dir = tempfile::tempdir().unwrap();
        let output = out_path(&dir, "nope.img");
        let err = fx
            .engine(&observer)
            .read_partition("nonexistent", &output)
            .unwrap_err();

        assert!(matches!(err, OdinError::NotFound { .. }));
        assert!(!output.exists());
    }

    #[test]
    fn test_write_streams_chunks_and_honors_ack() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        fx.queue_packet(OdinCommand::FileComplete, &[]);

        let dir = tempfile::tempdir().unwrap();
        let input = out_path(&dir, "boot.img");
        fs::write(&input, vec![0x5A; 300]).unwrap();

        let sent = fx.engine(&observer).write_partition("boot", &input).unwrap();
        assert_eq!(sent, 300);

        let writes = fx.mock.writes();
        // handshake magic, partition info, one data chunk, completion
        assert_eq!(writes.len(), 4);
        let mut expected_info = Vec::new();
        expected_info.extend_from_slice(&1u32.to_le_bytes());
        expected_info.extend_from_slice(&300u32.to_le_bytes());
        assert_eq!(
            writes[1],
            packet::encode(OdinCommand::PartitionInfo, &expected_info)
        );
        assert_eq!(
            writes[2],
            packet::encode(OdinCommand::FileTransfer, &[0x5A; 300])
        );
        assert_eq!(writes[3], packet::encode(OdinCommand::FileComplete, &[]));
    }

    #[test]
    fn test_write_ack_timeout_is_optimistic_success() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        // No acknowledgment queued: the ack read times out.

        let dir = tempfile::tempdir().unwrap();
        let input = out_path(&dir, "boot.img");
        fs::write(&input, b"payload").unwrap();

        let sent = fx.engine(&observer).write_partition("boot", &input).unwrap();
        assert_eq!(sent, 7);
    }

    #[test]
    fn test_write_empty_input_is_rejected() {
        let observer = NullObserver;
        let mut fx = Fixture::new();

        let dir = tempfile::tempdir().unwrap();
        let input = out_path(&dir, "empty.img");
        fs::write(&input, b"").unwrap();

        let err = fx
            .engine(&observer)
            .write_partition("boot", &input)
            .unwrap_err();
        assert!(matches!(err, OdinError::Io(_)));
    }

    #[test]
    fn test_write_missing_input_is_rejected() {
        let observer = NullObserver;
        let mut fx = Fixture::new();

        let dir = tempfile::tempdir().unwrap();
        let input = out_path(&dir, "missing.img");
        let err = fx
            .engine(&observer)
            .write_partition("boot", &input)
            .unwrap_err();
        assert!(matches!(err, OdinError::Io(_)));
    }

    #[test]
    fn test_erase_completes_on_ack() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        fx.queue_packet(OdinCommand::FileComplete, &[]);

        fx.engine(&observer).erase_partition("boot").unwrap();

        let writes = fx.mock.writes();
        assert_eq!(
            writes.last().unwrap(),
            &packet::encode(OdinCommand::ErasePartition, &1u32.to_le_bytes())
        );
    }

    #[test]
    fn test_erase_timeout_is_failure() {
        let observer = NullObserver;
        let mut fx = Fixture::new();
        // No completion queued: erase must NOT assume success.

        let err = fx.engine(&observer).erase_partition("boot").unwrap_err();
        assert!(matches!(err, OdinError::Transport(e) if e.is_timeout()));
    }

    #[test]
    fn test_file_digest_is_stable_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_path(&dir, "data.bin");
        fs::write(&path, b"abc").unwrap();

        let digest = file_digest(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
