//! Serial port transport built on `serialport`.

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::traits::{PortClaim, Transport, TransportError};

/// Delay after a baud change before the device UART is assumed reconfigured.
pub const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Serial port transport.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    claim: Option<PortClaim>,
    name: String,
    baud_rate: u32,
}

impl SerialTransport {
    /// Open a serial port at the given rate (8N1, no flow control).
    #[instrument(level = "info")]
    pub fn open(device: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let claim = PortClaim::acquire(device)?;
        let port = serialport::new(device, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| TransportError::PortUnavailable {
                port: device.to_string(),
                message: e.to_string(),
            })?;

        info!(port = %device, baud = baud_rate, "Opened serial port");

        Ok(Self {
            port: Some(port),
            claim: Some(claim),
            name: device.to_string(),
            baud_rate,
        })
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Disconnected)
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        port.set_timeout(timeout)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        match port.read(buf) {
            Ok(0) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(e) if e.kind() == ErrorKind::BrokenPipe || e.kind() == ErrorKind::NotConnected => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    #[instrument(skip(self), fields(port = %self.name))]
    fn set_baud_rate(&mut self, rate: u32) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.set_baud_rate(rate)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.clear(ClearBuffer::All)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        thread::sleep(BAUD_SETTLE_DELAY);
        debug!(from = self.baud_rate, to = rate, "Baud rate changed");
        self.baud_rate = rate;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.name, "Closed serial port");
        }
        self.claim = None;
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.name, self.baud_rate)
    }
}
