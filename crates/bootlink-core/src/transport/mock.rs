//! Scripted transport for testing link and handshake logic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{Transport, TransportError};
use crate::codec::FrameCodec;
use crate::protocol::with_status;

/// A queued read result.
#[derive(Debug, Clone)]
enum Scripted {
    Bytes(Vec<u8>),
    Timeout,
}

#[derive(Debug, Default)]
struct MockState {
    reads: VecDeque<Scripted>,
    writes: Vec<Vec<u8>>,
    bauds: Vec<u32>,
    connected: bool,
    /// Fail every I/O call with `Disconnected` once this many writes happened.
    disconnect_after_writes: Option<usize>,
}

/// Mock transport returning scripted bytes.
///
/// Clones share state, so a test keeps one handle for inspection while the
/// session owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    usb_ids: Option<(u16, u16)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..Default::default()
            })),
            usb_ids: None,
        }
    }

    /// Mock reporting the given USB ids.
    pub fn with_usb_ids(vid: u16, pid: u16) -> Self {
        Self {
            usb_ids: Some((vid, pid)),
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue raw bytes returned by the next read.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.state().reads.push_back(Scripted::Bytes(bytes.to_vec()));
    }

    /// Queue a read timeout.
    pub fn queue_timeout(&self) {
        self.state().reads.push_back(Scripted::Timeout);
    }

    /// Queue an encoded response frame: `command | RESPONSE_FLAG`, status, data.
    pub fn queue_response(&self, codec: &FrameCodec, command: u32, status: u32, data: &[u8]) {
        let payload = with_status(status, data);
        match codec.encode(command | crate::protocol::RESPONSE_FLAG, &payload) {
            Ok(frame) => self.queue_bytes(&frame),
            Err(e) => panic!("mock response does not encode: {e}"),
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Baud rates requested so far.
    pub fn baud_changes(&self) -> Vec<u32> {
        self.state().bauds.clone()
    }

    /// Number of scripted reads not yet consumed.
    pub fn pending_reads(&self) -> usize {
        self.state().reads.len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Disconnect once `count` writes have been accepted.
    pub fn disconnect_after_writes(&self, count: usize) {
        self.state().disconnect_after_writes = Some(count);
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        let mut state = self.state();
        state.connected = true;
        state.disconnect_after_writes = None;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        match state.reads.pop_front() {
            Some(Scripted::Bytes(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    state.reads.push_front(Scripted::Bytes(rest));
                }
                Ok(n)
            }
            Some(Scripted::Timeout) | None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        if let Some(limit) = state.disconnect_after_writes
            && state.writes.len() >= limit
        {
            state.connected = false;
        }
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), TransportError> {
        self.state().bauds.push(rate);
        Ok(())
    }

    fn close(&mut self) {
        self.state().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        self.usb_ids
    }
}
