//! nusb-based USB bulk transport.

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::traits::{PortClaim, Transport, TransportError};
use crate::protocol::constants::SUPPORTED_USB_IDS;

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Option<Interface>,
    claim: Option<PortClaim>,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

/// Enumerate attached USB devices.
fn enumerate() -> Result<impl Iterator<Item = nusb::DeviceInfo>, TransportError> {
    list_devices()
        .wait()
        .map_err(|e| TransportError::PortUnavailable {
            port: "usb".into(),
            message: e.to_string(),
        })
}

/// Bulk IN and OUT endpoint addresses of interface 0.
fn bulk_endpoints(device: &nusb::Device) -> Result<(u8, u8), TransportError> {
    let mut in_endpoint = None;
    let mut out_endpoint = None;

    for config in device.configurations() {
        for iface in config.interfaces().filter(|i| i.interface_number() == 0) {
            for alt in iface.alt_settings() {
                for ep in alt.endpoints() {
                    if ep.transfer_type() != nusb::descriptors::TransferType::Bulk {
                        continue;
                    }
                    let slot = match ep.direction() {
                        nusb::transfer::Direction::In => &mut in_endpoint,
                        nusb::transfer::Direction::Out => &mut out_endpoint,
                    };
                    slot.get_or_insert(ep.address());
                }
            }
        }
    }

    let missing = |direction: &str| TransportError::EndpointNotFound {
        ep_type: "Bulk".into(),
        direction: direction.into(),
    };
    Ok((
        in_endpoint.ok_or_else(|| missing("In"))?,
        out_endpoint.ok_or_else(|| missing("Out"))?,
    ))
}

impl NusbTransport {
    /// Open the first attached device from [`SUPPORTED_USB_IDS`].
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let device_info = enumerate()?
            .find(|d| SUPPORTED_USB_IDS.contains(&(d.vendor_id(), d.product_id())))
            .ok_or(TransportError::DeviceNotFound { vid: 0, pid: 0 })?;
        Self::open_device_info(device_info)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = enumerate()?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;
        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();
        let port = format!("usb:{:03}:{:03}", device_info.busnum(), device_info.device_address());
        let claim = PortClaim::acquire(&port)?;
        debug!(port = %port, "{:04X}:{:04X} matched", vid, pid);

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::PortUnavailable {
                port: port.clone(),
                message: e.to_string(),
            })?;
        let interface = device
            .claim_interface(0)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: e.to_string(),
            })?;
        let (in_endpoint, out_endpoint) = bulk_endpoints(&device)?;

        info!(
            port = %port,
            "Opened {:04X}:{:04X} (bulk in 0x{:02X}, out 0x{:02X})",
            vid, pid, in_endpoint, out_endpoint
        );
        Ok(Self {
            interface: Some(interface),
            claim: Some(claim),
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::Disconnected)
    }
}

impl Transport for NusbTransport {
    #[instrument(skip(self, buf), fields(max_len = buf.len()))]
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let ep = self
            .interface()?
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(4096).with_read_timeout(timeout);
        match reader.read(buf) {
            Ok(n) => {
                debug!(bytes_read = n, "Read complete");
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(e) if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::BrokenPipe => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
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

    fn close(&mut self) {
        self.interface = None;
        self.claim = None;
    }

    fn is_connected(&self) -> bool {
        // nusb has no cheap liveness probe; a released interface is the
        // only definite signal.
        self.interface.is_some()
    }

    fn describe(&self) -> String {
        match &self.claim {
            Some(claim) => format!("{} ({:04X}:{:04X})", claim.port(), self.vid, self.pid),
            None => format!("usb ({:04X}:{:04X}, closed)", self.vid, self.pid),
        }
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        Some((self.vid, self.pid))
    }
}
