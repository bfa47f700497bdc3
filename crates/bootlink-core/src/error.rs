//! Error taxonomy for device sessions.
//!
//! Every device-facing failure carries an [`ErrorContext`] naming the last
//! command on the wire and, once identified, the chip.

use std::fmt;
use thiserror::Error;

use crate::codec::CodecError;
use crate::partition::CatalogError;
use crate::protocol::CommandCode;
use crate::sparse::SparseError;
use crate::transport::TransportError;

/// Where a device-facing error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub last_command: Option<CommandCode>,
    pub chip: Option<String>,
}

impl ErrorContext {
    pub fn is_empty(&self) -> bool {
        self.last_command.is_none() && self.chip.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, " [")?;
        if let Some(cmd) = self.last_command {
            write!(f, "last command {cmd}")?;
            if self.chip.is_some() {
                write!(f, ", ")?;
            }
        }
        if let Some(chip) = &self.chip {
            write!(f, "chip {chip}")?;
        }
        write!(f, "]")
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Port unavailable: {port}: {message}")]
    PortUnavailable { port: String, message: String },

    #[error("Timed out waiting for response{context}")]
    Timeout { context: ErrorContext },

    #[error("Frame corruption: {detail}{context}")]
    FrameCorruption {
        detail: String,
        context: ErrorContext,
    },

    #[error("Checksum mismatch persisted over {attempts} attempts{context}")]
    ChecksumMismatch { attempts: u32, context: ErrorContext },

    #[error("Handshake exhausted after {cycles} cycles{context}")]
    HandshakeExhausted { cycles: u32, context: ErrorContext },

    #[error("Chip rejects unsigned agents and no credential or exploit is configured{context}")]
    SignatureRequired { context: ErrorContext },

    #[error("Exploit '{name}' failed: device answered '{ack}'{context}")]
    ExploitFailed {
        name: String,
        ack: String,
        context: ErrorContext,
    },

    #[error("Partition '{partition}' requires vendor authorization{context}")]
    NotAuthorized {
        partition: String,
        context: ErrorContext,
    },

    #[error("Source of {size} bytes does not fit partition '{partition}' ({capacity} bytes)")]
    SizeMismatch {
        partition: String,
        size: u64,
        capacity: u64,
    },

    #[error("Partition catalog corrupt: {0}")]
    CatalogCorrupt(#[from] CatalogError),

    #[error("Device disconnected{context}")]
    DeviceDisconnected { context: ErrorContext },

    #[error("Agent did not come up within {waited_ms}ms of handoff{context}")]
    HandoffTimeout { waited_ms: u64, context: ErrorContext },

    #[error("Link desynchronized after switching to {baud} baud{context}")]
    Desynchronized { baud: u32, context: ErrorContext },

    #[error("Authentication rejected: {reason}{context}")]
    AuthRejected {
        reason: String,
        context: ErrorContext,
    },

    #[error("Device returned status {status}{context}")]
    DeviceError { status: u32, context: ErrorContext },

    #[error("Unknown partition '{name}'")]
    UnknownPartition { name: String },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Session is not ready: {state}")]
    NotReady { state: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,

    #[error("Session busy with another operation")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlashError {
    /// Errors after which the session must not be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlashError::DeviceDisconnected { .. }
                | FlashError::HandoffTimeout { .. }
                | FlashError::SessionClosed
        )
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            FlashError::Timeout { context }
            | FlashError::FrameCorruption { context, .. }
            | FlashError::ChecksumMismatch { context, .. }
            | FlashError::HandshakeExhausted { context, .. }
            | FlashError::SignatureRequired { context }
            | FlashError::ExploitFailed { context, .. }
            | FlashError::NotAuthorized { context, .. }
            | FlashError::DeviceDisconnected { context }
            | FlashError::HandoffTimeout { context, .. }
            | FlashError::Desynchronized { context, .. }
            | FlashError::AuthRejected { context, .. }
            | FlashError::DeviceError { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Classify a codec failure.
    pub(crate) fn from_codec(err: CodecError, context: ErrorContext) -> Self {
        match err {
            CodecError::ChecksumMismatch { .. } => FlashError::ChecksumMismatch {
                attempts: 1,
                context,
            },
            CodecError::Incomplete { .. } => FlashError::Timeout { context },
            other => FlashError::FrameCorruption {
                detail: other.to_string(),
                context,
            },
        }
    }

    /// Classify a transport failure. I/O failures after the device has
    /// answered at least once mean it went away.
    pub(crate) fn from_transport(
        err: TransportError,
        port: String,
        had_success: bool,
        context: ErrorContext,
    ) -> Self {
        match err {
            TransportError::Timeout { .. } => FlashError::Timeout { context },
            e if e.is_fatal_io() && had_success => FlashError::DeviceDisconnected { context },
            TransportError::PortUnavailable { port, message } => {
                FlashError::PortUnavailable { port, message }
            }
            e => FlashError::PortUnavailable {
                port,
                message: e.to_string(),
            },
        }
    }
}

impl From<SparseError> for FlashError {
    fn from(err: SparseError) -> Self {
        match err {
            SparseError::Io(e) => FlashError::Io(e),
            other => FlashError::InvalidImage(other.to_string()),
        }
    }
}

impl From<TransportError> for FlashError {
    fn from(err: TransportError) -> Self {
        FlashError::from_transport(err, "transport".into(), false, ErrorContext::default())
    }
}

pub type Result<T, E = FlashError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::CMD_READ;

    #[test]
    fn test_context_display() {
        let context = ErrorContext {
            last_command: Some(CommandCode(CMD_READ)),
            chip: Some("0766".into()),
        };
        let err = FlashError::Timeout { context };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for response [last command read(0x0030), chip 0766]"
        );
        assert_eq!(
            FlashError::Timeout {
                context: ErrorContext::default()
            }
            .to_string(),
            "Timed out waiting for response"
        );
    }

    #[test]
    fn test_transport_classification() {
        let ctx = ErrorContext::default();
        assert!(matches!(
            FlashError::from_transport(TransportError::Disconnected, "p".into(), true, ctx.clone()),
            FlashError::DeviceDisconnected { .. }
        ));
        assert!(matches!(
            FlashError::from_transport(TransportError::Disconnected, "p".into(), false, ctx.clone()),
            FlashError::PortUnavailable { .. }
        ));
        assert!(matches!(
            FlashError::from_transport(TransportError::Timeout { timeout_ms: 5 }, "p".into(), true, ctx),
            FlashError::Timeout { .. }
        ));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(
            FlashError::DeviceDisconnected {
                context: ErrorContext::default()
            }
            .is_fatal()
        );
        assert!(!FlashError::Busy.is_fatal());
    }
}
