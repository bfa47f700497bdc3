//! Event system for front-end decoupling.
//!
//! Sessions report phase changes, progress and log lines through a
//! [`FlashObserver`]. Observers are called on the thread running the
//! operation and must return quickly; [`ChannelObserver`] hands events to
//! another thread without blocking.

use std::fmt;
use std::sync::mpsc::{Receiver, Sender, channel};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Idle,
    Handshake,
    Exploit,
    AgentUpload,
    Authenticating,
    Catalog,
    Reading,
    Writing,
    Erasing,
    Patching,
    Complete,
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashPhase::Idle => "Idle",
            FlashPhase::Handshake => "Handshake",
            FlashPhase::Exploit => "Exploit",
            FlashPhase::AgentUpload => "Agent Upload",
            FlashPhase::Authenticating => "Authenticating",
            FlashPhase::Catalog => "Partition Catalog",
            FlashPhase::Reading => "Reading",
            FlashPhase::Writing => "Writing",
            FlashPhase::Erasing => "Erasing",
            FlashPhase::Patching => "Patching",
            FlashPhase::Complete => "Complete",
            FlashPhase::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Port opened.
    DeviceConnected {
        port: String,
        usb_ids: Option<(u16, u16)>,
    },
    /// Device went away; the session is invalid.
    DeviceDisconnected,
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Handshake state machine transition.
    HandshakeTransition { from: String, to: String },
    /// Progress update for current operation.
    Progress {
        operation: String,
        done: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Acknowledgement code received from device.
    AckReceived { ack: String },
    /// Frame sent/received.
    Packet {
        direction: PacketDirection,
        command: u32,
        length: usize,
    },
    /// All operations completed successfully.
    Complete,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your front-end to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);

    fn on_progress(&self, operation: &str, done: u64, total: u64) {
        self.on_event(&FlashEvent::Progress {
            operation: operation.to_string(),
            done,
            total,
        });
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        self.on_event(&FlashEvent::Log {
            level,
            message: message.to_string(),
        });
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { port, usb_ids } => match usb_ids {
                Some((vid, pid)) => tracing::info!(
                    port = %port,
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Device connected"
                ),
                None => tracing::info!(port = %port, "Device connected"),
            },
            FlashEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::HandshakeTransition { from, to } => {
                tracing::debug!(from = %from, to = %to, "Handshake transition");
            }
            FlashEvent::Progress {
                operation,
                done,
                total,
            } => {
                let pct = if *total > 0 { (*done * 100) / *total } else { 0 };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::AckReceived { ack } => {
                tracing::debug!(ack = %ack, "ACK received");
            }
            FlashEvent::Packet {
                direction,
                command,
                length,
            } => {
                tracing::trace!(
                    dir = %direction,
                    command = %crate::protocol::CommandCode(*command),
                    len = length,
                    "Frame"
                );
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Forwards events over an mpsc channel.
///
/// Sending never blocks; events are dropped once the receiver is gone.
pub struct ChannelObserver {
    sender: Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<FlashEvent>) {
        let (sender, receiver) = channel();
        (Self { sender }, receiver)
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        let _ = self.sender.send(event.clone());
    }
}
