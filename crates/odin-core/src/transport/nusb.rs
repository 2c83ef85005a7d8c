//! nusb-based bulk transport implementation.

use std::io::{Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{BulkTransport, TransportError};
use crate::protocol::constants::{ODIN_MODE_PIDS, SAMSUNG_VENDOR_ID};

/// nusb-based bulk transport.
///
/// Owns the interface claim for the lifetime of the session. The claim is
/// released (and a detached kernel driver reattached by the backend) when
/// [`BulkTransport::release`] is called or the transport is dropped.
pub struct NusbTransport {
    interface: Option<Interface>,
    in_endpoint: u8,
    out_endpoint: u8,
    detached_kernel_driver: bool,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device matching a known download-mode product id.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == SAMSUNG_VENDOR_ID
                && ODIN_MODE_PIDS.contains(&device_info.product_id())
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: SAMSUNG_VENDOR_ID,
        })
    }

    /// Open every same-vendor device that did NOT match a known product id.
    ///
    /// Some bootloader revisions enumerate with unlisted PIDs; candidates
    /// returned here still need a throwaway handshake probe before use.
    /// Devices that fail endpoint setup are skipped.
    pub fn open_vendor_candidates() -> Vec<Self> {
        let devices = match list_devices().wait() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "device enumeration failed");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for device_info in devices {
            if device_info.vendor_id() != SAMSUNG_VENDOR_ID
                || ODIN_MODE_PIDS.contains(&device_info.product_id())
            {
                continue;
            }
            match Self::open_device_info(device_info) {
                Ok(t) => candidates.push(t),
                Err(e) => debug!(error = %e, "candidate endpoint setup failed"),
            }
        }
        candidates
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // First interface/alt-setting exposing one bulk IN and one bulk OUT.
        let mut chosen: Option<(u8, u8, u8)> = None;
        'outer: for config in device.configurations() {
            for iface in config.interfaces() {
                for alt in iface.alt_settings() {
                    let mut in_endpoint: u8 = 0;
                    let mut out_endpoint: u8 = 0;
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                    if in_endpoint != 0 && out_endpoint != 0 {
                        chosen = Some((iface.interface_number(), in_endpoint, out_endpoint));
                        break 'outer;
                    }
                }
            }
        }

        let Some((interface_number, in_endpoint, out_endpoint)) = chosen else {
            return Err(TransportError::EndpointNotFound);
        };

        // Plain claim first; fall back to detaching the kernel driver and
        // record that so teardown knows a reattach is owed.
        let mut detached_kernel_driver = false;
        let interface = match device.claim_interface(interface_number).wait() {
            Ok(i) => i,
            Err(first) => {
                debug!(error = %first, interface = interface_number, "claim failed, detaching kernel driver");
                detached_kernel_driver = true;
                device
                    .detach_and_claim_interface(interface_number)
                    .wait()
                    .map_err(|e| TransportError::ClaimInterfaceFailed {
                        interface: interface_number,
                        message: e.to_string(),
                    })?
            }
        };

        info!(
            interface = interface_number,
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface: Some(interface),
            in_endpoint,
            out_endpoint,
            detached_kernel_driver,
            vid,
            pid,
        })
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::Disconnected)
    }
}

impl BulkTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let ep = self
            .interface()?
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096);
        writer
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface()?
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(4096);
        let mut buf = vec![0u8; max_len];

        let n = reader.read(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                TransportError::ReadFailed(e.to_string())
            }
        })?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn release(&mut self) {
        if let Some(interface) = self.interface.take() {
            if self.detached_kernel_driver {
                debug!("releasing claim; kernel driver reattach owed to the backend");
            }
            // Dropping the claim releases the interface and reattaches a
            // detached kernel driver.
            drop(interface);
        }
    }

    fn is_connected(&self) -> bool {
        self.interface.is_some()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
