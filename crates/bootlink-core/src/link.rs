//! Request/response link over one transport and the selected codec.
//!
//! A [`DeviceLink`] sends one command frame and collects exactly one
//! response frame for it. Checksum mismatches and single-frame timeouts are
//! retried transparently by re-sending the request; everything else is
//! surfaced as a [`FlashError`] carrying the last command and chip.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::codec::{FrameCodec, ProtocolVariant};
use crate::error::{ErrorContext, FlashError, Result};
use crate::events::{FlashEvent, FlashObserver, LogLevel, PacketDirection};
use crate::protocol::constants::{RESPONSE_FLAG, STATUS_OK};
use crate::protocol::{CommandCode, split_status};
use crate::transport::Transport;

const READ_CHUNK: usize = 64 * 1024;

/// Bounds for transparent retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub checksum_retries: u32,
    pub timeout_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            checksum_retries: 3,
            timeout_retries: 2,
        }
    }
}

/// Decoded response: status word plus data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u32,
    pub data: Vec<u8>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

pub struct DeviceLink {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
    observer: Arc<dyn FlashObserver>,
    retry: RetryPolicy,
    last_command: Option<CommandCode>,
    chip: Option<String>,
    had_success: bool,
    disconnected: bool,
    rx: Vec<u8>,
    scratch: Vec<u8>,
}

impl DeviceLink {
    pub fn new(
        transport: Box<dyn Transport>,
        variant: ProtocolVariant,
        observer: Arc<dyn FlashObserver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            codec: FrameCodec::for_variant(variant),
            observer,
            retry,
            last_command: None,
            chip: None,
            had_success: false,
            disconnected: false,
            rx: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.codec.variant()
    }

    /// Switch codecs. Buffered bytes belong to the old variant and are dropped.
    pub fn set_codec(&mut self, codec: FrameCodec) {
        self.codec = codec;
        self.rx.clear();
    }

    pub fn set_checksum(&mut self, enabled: bool) {
        self.codec.set_checksum(enabled);
    }

    pub fn set_chip(&mut self, chip: Option<String>) {
        self.chip = chip;
    }

    pub fn last_command(&self) -> Option<CommandCode> {
        self.last_command
    }

    pub fn context(&self) -> ErrorContext {
        ErrorContext {
            last_command: self.last_command,
            chip: self.chip.clone(),
        }
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        self.transport.usb_ids()
    }

    /// True once an I/O failure followed a successful exchange.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn transport_error(&mut self, err: crate::transport::TransportError) -> FlashError {
        let err = FlashError::from_transport(
            err,
            self.transport.describe(),
            self.had_success,
            self.context(),
        );
        if matches!(err, FlashError::DeviceDisconnected { .. }) && !self.disconnected {
            self.disconnected = true;
            self.observer.on_event(&FlashEvent::DeviceDisconnected);
        }
        err
    }

    fn send(&mut self, command: u32, payload: &[u8]) -> Result<()> {
        if self.disconnected {
            return Err(FlashError::DeviceDisconnected {
                context: self.context(),
            });
        }
        self.last_command = Some(CommandCode(command));
        let frame = self
            .codec
            .encode(command, payload)
            .map_err(|e| FlashError::from_codec(e, self.context()))?;
        if let Err(e) = self.transport.write(&frame) {
            return Err(self.transport_error(e));
        }
        trace!(command = %CommandCode(command), len = frame.len(), "Frame sent");
        self.observer.on_event(&FlashEvent::Packet {
            direction: PacketDirection::Tx,
            command,
            length: frame.len(),
        });
        Ok(())
    }

    /// Accumulate reads until the codec reports one complete frame.
    fn receive(&mut self, timeout: Duration) -> Result<crate::codec::Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.codec.frame_len(&self.rx) {
                Ok(Some(len)) => {
                    let bytes: Vec<u8> = self.rx.drain(..len).collect();
                    let frame = self
                        .codec
                        .decode(&bytes)
                        .map_err(|e| FlashError::from_codec(e, self.context()))?;
                    self.observer.on_event(&FlashEvent::Packet {
                        direction: PacketDirection::Rx,
                        command: frame.command,
                        length: bytes.len(),
                    });
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.rx.clear();
                    return Err(FlashError::from_codec(e, self.context()));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FlashError::Timeout {
                    context: self.context(),
                });
            }
            match self.transport.read(&mut self.scratch, remaining) {
                Ok(n) => self.rx.extend_from_slice(&self.scratch[..n]),
                Err(e) => return Err(self.transport_error(e)),
            }
        }
    }

    fn receive_response(&mut self, command: u32, timeout: Duration) -> Result<Response> {
        let frame = self.receive(timeout)?;
        let expected = command | RESPONSE_FLAG;
        if frame.command != expected {
            return Err(FlashError::FrameCorruption {
                detail: format!(
                    "expected response {}, got {}",
                    CommandCode(expected),
                    CommandCode(frame.command)
                ),
                context: self.context(),
            });
        }
        let (status, data) = split_status(&frame.payload).map_err(|e| {
            FlashError::FrameCorruption {
                detail: e.to_string(),
                context: self.context(),
            }
        })?;
        Ok(Response {
            status,
            data: data.to_vec(),
        })
    }

    fn exchange(
        &mut self,
        command: u32,
        payload: &[u8],
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Response> {
        let mut checksum_failures = 0;
        let mut timeouts = 0;
        loop {
            self.send(command, payload)?;
            match self.receive_response(command, timeout) {
                Ok(response) => {
                    self.had_success = true;
                    return Ok(response);
                }
                Err(FlashError::ChecksumMismatch { .. })
                    if checksum_failures < retry.checksum_retries =>
                {
                    checksum_failures += 1;
                    self.observer.on_log(
                        LogLevel::Warn,
                        &format!(
                            "checksum mismatch on {} (attempt {}), resending",
                            CommandCode(command),
                            checksum_failures
                        ),
                    );
                    self.rx.clear();
                }
                Err(FlashError::ChecksumMismatch { .. }) => {
                    return Err(FlashError::ChecksumMismatch {
                        attempts: checksum_failures + 1,
                        context: self.context(),
                    });
                }
                Err(FlashError::Timeout { .. }) if timeouts < retry.timeout_retries => {
                    timeouts += 1;
                    debug!(
                        command = %CommandCode(command),
                        attempt = timeouts,
                        "Response timeout, resending"
                    );
                    self.rx.clear();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request with the full retry policy; returns status and data.
    pub fn request(&mut self, command: u32, payload: &[u8], timeout: Duration) -> Result<Response> {
        self.exchange(command, payload, timeout, self.retry)
    }

    /// One request without timeout retries, for probing a device that may
    /// not speak the current variant.
    pub fn probe(&mut self, command: u32, payload: &[u8], timeout: Duration) -> Result<Response> {
        let retry = RetryPolicy {
            timeout_retries: 0,
            ..self.retry
        };
        self.exchange(command, payload, timeout, retry)
    }

    /// Send exactly once, for requests the device must never see twice
    /// (credentials). Any failure is returned as is.
    pub fn request_once(
        &mut self,
        command: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        let retry = RetryPolicy {
            checksum_retries: 0,
            timeout_retries: 0,
        };
        self.exchange(command, payload, timeout, retry)
    }

    /// Like [`request`](Self::request) but non-zero status is an error.
    pub fn transact(&mut self, command: u32, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let response = self.request(command, payload, timeout)?;
        if !response.is_ok() {
            return Err(FlashError::DeviceError {
                status: response.status,
                context: self.context(),
            });
        }
        Ok(response.data)
    }

    pub fn set_baud_rate(&mut self, rate: u32) -> Result<()> {
        self.rx.clear();
        self.transport
            .set_baud_rate(rate)
            .map_err(|e| self.transport_error(e))
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.rx.clear();
    }
}
