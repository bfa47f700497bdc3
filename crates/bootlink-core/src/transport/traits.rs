//! Transport layer abstraction.
//!
//! Defines the [`Transport`] trait for one physical serial/USB endpoint,
//! allowing different implementations (serial, nusb, mock, simulator).

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port unavailable: {port}: {message}")]
    PortUnavailable { port: String, message: String },

    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Baud rate {0} not supported by this transport")]
    BaudRateUnsupported(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error means the device is gone, as opposed to slow.
    pub fn is_fatal_io(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::ReadFailed(_)
                | TransportError::WriteFailed(_)
                | TransportError::Io(_)
        )
    }
}

/// Abstract byte-stream transport.
///
/// Implementations are exclusively owned by one session; all calls are
/// strictly sequential.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns `Timeout` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write all bytes, returning the count written.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Reconfigure the line rate. Only serial transports support this; the
    /// new rate is effective once this returns.
    fn set_baud_rate(&mut self, rate: u32) -> Result<(), TransportError> {
        Err(TransportError::BaudRateUnsupported(rate))
    }

    /// Release the underlying port. Further I/O fails with `Disconnected`.
    fn close(&mut self);

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Human-readable port description for logs.
    fn describe(&self) -> String;

    /// USB vendor/product id when known.
    fn usb_ids(&self) -> Option<(u16, u16)> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), TransportError> {
        (**self).set_baud_rate(rate)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        (**self).usb_ids()
    }
}

fn claimed_ports() -> &'static Mutex<HashSet<String>> {
    static PORTS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    PORTS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a physical port name, released on drop.
#[derive(Debug)]
pub struct PortClaim {
    port: String,
}

impl PortClaim {
    pub fn acquire(port: &str) -> Result<Self, TransportError> {
        let mut ports = claimed_ports()
            .lock()
            .map_err(|_| TransportError::PortUnavailable {
                port: port.to_string(),
                message: "port registry poisoned".into(),
            })?;
        if !ports.insert(port.to_string()) {
            return Err(TransportError::PortUnavailable {
                port: port.to_string(),
                message: "already held by another session".into(),
            });
        }
        Ok(Self {
            port: port.to_string(),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        if let Ok(mut ports) = claimed_ports().lock() {
            ports.remove(&self.port);
        }
    }
}
