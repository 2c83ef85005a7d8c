//! High-level flashing client.
//!
//! For every public operation the external authoritative tool runs
//! first; the raw protocol is the fallback, reached only when the tool
//! is absent or failed. This is also the single home of the force gate
//! for destructive or unverified paths.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{OdinError, Result};
use crate::events::{FlashEvent, FlashObserver, TracingObserver};
use crate::pit::{Partition, PartitionCatalog, PitParser};
use crate::protocol::packet::OdinCommand;
use crate::session::{DeviceSession, HANDSHAKE_ATTEMPTS};
use crate::tool::HeimdallTool;
use crate::transfer::TransferEngine;
use crate::transport::{BulkTransport, NusbTransport};

/// Client configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Explicit path to the external flashing tool. Resolved from PATH
    /// when unset.
    pub tool_path: Option<String>,
    /// Handshake attempts before giving up.
    pub handshake_attempts: Option<u32>,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AnyResult<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Tool-first flashing client with raw-protocol fallback.
pub struct OdinClient<T: BulkTransport, O: FlashObserver> {
    session: DeviceSession<T>,
    catalog: PartitionCatalog,
    parser: PitParser,
    tool: Option<HeimdallTool>,
    observer: Arc<O>,
    handshake_attempts: u32,
}

impl OdinClient<NusbTransport, TracingObserver> {
    /// Discover a download-mode device and build a client with the
    /// default tracing observer.
    pub fn discover(config: &ClientConfig) -> Result<Self> {
        let session = DeviceSession::discover()?;
        Ok(Self::with_observer(config, session, Arc::new(TracingObserver)))
    }
}

impl<T: BulkTransport, O: FlashObserver> OdinClient<T, O> {
    /// Build a client around an already-discovered session.
    ///
    /// The tool path is resolved exactly once, here.
    pub fn with_observer(config: &ClientConfig, session: DeviceSession<T>, observer: Arc<O>) -> Self {
        let tool = match &config.tool_path {
            Some(path) => Some(HeimdallTool::new(path)),
            None => HeimdallTool::locate(),
        };
        Self::assemble(config, session, tool, observer)
    }

    /// Build a client with an explicit tool handle (or none). Used by
    /// embedders and tests that must not consult PATH.
    pub fn with_tool(
        config: &ClientConfig,
        session: DeviceSession<T>,
        tool: Option<HeimdallTool>,
        observer: Arc<O>,
    ) -> Self {
        Self::assemble(config, session, tool, observer)
    }

    fn assemble(
        config: &ClientConfig,
        session: DeviceSession<T>,
        tool: Option<HeimdallTool>,
        observer: Arc<O>,
    ) -> Self {
        match &tool {
            Some(t) => info!(tool = %t.path().display(), "external flashing tool available"),
            None => info!("no external flashing tool; raw protocol only"),
        }
        if let (Some(vid), Some(pid)) = (session.vendor_id(), session.product_id()) {
            observer.on_event(&FlashEvent::DeviceConnected { vid, pid });
        }
        Self {
            session,
            catalog: PartitionCatalog::new(),
            parser: PitParser::new(),
            tool,
            observer,
            handshake_attempts: config.handshake_attempts.unwrap_or(HANDSHAKE_ATTEMPTS),
        }
    }

    /// Establish the protocol session.
    pub fn connect(&mut self) -> Result<()> {
        self.session.establish(self.handshake_attempts)?;
        self.observer.on_event(&FlashEvent::SessionEstablished);
        Ok(())
    }

    /// Tear everything down. Idempotent.
    pub fn disconnect(&mut self) {
        self.session.disconnect();
        self.catalog.clear();
        self.observer.on_event(&FlashEvent::DeviceDisconnected);
    }

    /// Detect the partition layout (cached per session).
    ///
    /// `pit_path` lets a caller hand over an on-disk PIT for the
    /// authoritative tool to parse instead of touching the device.
    pub fn detect_partition_layout(
        &mut self,
        pit_path: Option<&Path>,
    ) -> &BTreeMap<String, Partition> {
        self.catalog
            .detect_layout(&self.parser, self.tool.as_ref(), pit_path, &mut self.session);
        self.catalog.partitions()
    }

    /// Download the PIT to a file.
    #[instrument(skip(self, output), fields(output = %output.display()))]
    pub fn download_pit(&mut self, output: &Path) -> Result<()> {
        if let Some(tool) = &self.tool {
            match tool.download_pit(output) {
                Ok(()) => {
                    info!("PIT downloaded via external tool");
                    return Ok(());
                }
                Err(e) => self.fall_back("download-pit", &e),
            }
        }
        let data = self.session.download_pit()?;
        fs::write(output, &data)?;
        Ok(())
    }

    /// Read a partition into a file. Non-destructive, so the raw path
    /// needs no force flag.
    #[instrument(skip(self, output), fields(output = %output.display()))]
    pub fn read_partition(&mut self, name: &str, output: &Path) -> Result<u64> {
        if let Some(tool) = &self.tool {
            match tool.dump(name, output) {
                Ok(()) => {
                    info!(partition = name, "partition read via external tool");
                    return Ok(fs::metadata(output)?.len());
                }
                Err(e) => self.fall_back("read", &e),
            }
        }
        self.engine().read_partition(name, output)
    }

    /// Flash a file to a partition.
    ///
    /// The raw-protocol path is unverified and runs only with `force`.
    #[instrument(skip(self, input), fields(input = %input.display()))]
    pub fn write_partition(&mut self, name: &str, input: &Path, force: bool) -> Result<u64> {
        if let Some(tool) = &self.tool {
            match tool.flash(name, input) {
                Ok(()) => {
                    info!(partition = name, "partition flashed via external tool");
                    return Ok(fs::metadata(input)?.len());
                }
                Err(e) => self.fall_back("write", &e),
            }
        }
        if !force {
            return Err(OdinError::SafetyGate(
                "raw-protocol write is experimental and unverified; install the external \
                 flashing tool (the safe path), or pass --force to proceed at your own risk"
                    .into(),
            ));
        }
        warn!("raw-protocol write engaged; this path is experimental and unverified");
        self.engine().write_partition(name, input)
    }

    /// Erase a partition. Irreversible, so `force` is required up front
    /// regardless of tool availability.
    #[instrument(skip(self))]
    pub fn erase_partition(&mut self, name: &str, force: bool) -> Result<()> {
        if !force {
            return Err(OdinError::SafetyGate(
                "erase is irreversible and always requires --force".into(),
            ));
        }
        if let Some(tool) = &self.tool {
            match tool.erase(name) {
                Ok(()) => {
                    info!(partition = name, "partition erased via external tool");
                    return Ok(());
                }
                Err(e) => self.fall_back("erase", &e),
            }
        }
        self.engine().erase_partition(name)
    }

    /// Reboot the device out of download mode.
    #[instrument(skip(self))]
    pub fn reboot_device(&mut self) -> Result<()> {
        if let Some(tool) = &self.tool {
            match tool.reboot() {
                Ok(()) => {
                    info!("device rebooted via external tool");
                    return Ok(());
                }
                Err(e) => self.fall_back("reboot", &e),
            }
        }
        self.session.ensure_established()?;
        self.session.send_packet(OdinCommand::Reboot, &[])
    }

    fn fall_back(&self, operation: &'static str, error: &dyn fmt::Display) {
        self.observer.on_event(&FlashEvent::ToolFallback {
            operation,
            reason: error.to_string(),
        });
    }

    fn engine(&mut self) -> TransferEngine<'_, T, O> {
        TransferEngine::new(
            &mut self.session,
            &mut self.catalog,
            &self.parser,
            self.tool.as_ref(),
            self.observer.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::pit::Partition;
    use crate::transport::MockTransport;

    fn client_without_tool() -> (MockTransport, OdinClient<MockTransport, NullObserver>) {
        let mock = MockTransport::new();
        let session = DeviceSession::new(mock.clone());
        let client = OdinClient::with_tool(
            &ClientConfig::default(),
            session,
            None,
            Arc::new(NullObserver),
        );
        (mock, client)
    }

    #[test]
    fn test_write_without_force_is_safety_gated() {
        let (_mock, mut client) = client_without_tool();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("boot.img");
        fs::write(&input, b"image").unwrap();

        let err = client.write_partition("boot", &input, false).unwrap_err();
        assert!(matches!(err, OdinError::SafetyGate(_)));
    }

    #[test]
    fn test_erase_without_force_is_gated_even_with_tool() {
        let mock = MockTransport::new();
        let session = DeviceSession::new(mock);
        let mut client = OdinClient::with_tool(
            &ClientConfig::default(),
            session,
            Some(HeimdallTool::new("true")),
            Arc::new(NullObserver),
        );

        let err = client.erase_partition("userdata", false).unwrap_err();
        assert!(matches!(err, OdinError::SafetyGate(_)));
    }

    #[test]
    fn test_write_with_force_uses_raw_protocol() {
        let (mock, mut client) = client_without_tool();
        // Pre-seed the layout so resolution stays local, arm the handshake,
        // and leave the ack to time out (optimistic success).
        let mut part = Partition::named("boot");
        part.id = Some(1);
        client.catalog.install(vec![part]);
        mock.queue_response(b"LOKE");

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("boot.img");
        fs::write(&input, b"image-bytes").unwrap();

        let sent = client.write_partition("boot", &input, true).unwrap();
        assert_eq!(sent, 11);
        assert!(!mock.writes().is_empty());
    }

    #[test]
    fn test_erase_with_force_and_failing_tool_falls_back() {
        let mock = MockTransport::new();
        let session = DeviceSession::new(mock.clone());
        let mut client = OdinClient::with_tool(
            &ClientConfig::default(),
            session,
            Some(HeimdallTool::new("false")),
            Arc::new(NullObserver),
        );
        let mut part = Partition::named("cache");
        part.id = Some(5);
        client.catalog.install(vec![part]);
        mock.queue_response(b"LOKE");
        mock.queue_packet(OdinCommand::FileComplete, &[]);

        client.erase_partition("cache", true).unwrap();
    }

    #[test]
    fn test_disconnect_is_idempotent_and_clears_catalog() {
        let (_mock, mut client) = client_without_tool();
        client.catalog.install(vec![Partition::named("boot")]);

        client.disconnect();
        assert!(client.catalog.partitions().is_empty());
        client.disconnect();
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = ClientConfig {
            tool_path: Some("/usr/local/bin/heimdall".into()),
            handshake_attempts: Some(5),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        config.save_to_file(&path).unwrap();

        let loaded = ClientConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.tool_path.as_deref(), Some("/usr/local/bin/heimdall"));
        assert_eq!(loaded.handshake_attempts, Some(5));
    }
}
