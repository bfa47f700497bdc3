//! Frame codecs for the three wire protocol variants.
//!
//! Every variant implements the same contract:
//! `encode(command, payload) -> frame` and `decode(frame) -> Frame`.
//! [`FrameCodec`] is a closed union over the variants; adding a variant
//! means adding a case here, not a new trait object.

pub mod binary;
pub mod hdlc;
pub mod xml;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol::constants::{
    BINARY_MAX_PAYLOAD, HDLC_BAUD_SEQUENCE, HDLC_MAX_PAYLOAD, XML_MAX_PAYLOAD,
};

pub use binary::BinaryCodec;
pub use hdlc::HdlcCodec;
pub use xml::XmlCodec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Frame corruption: {0}")]
    FrameCorruption(String),

    #[error("Incomplete frame: have {have} bytes")]
    Incomplete { have: usize },

    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Command id 0x{0:X} cannot be encoded by this variant")]
    InvalidCommand(u32),
}

/// Decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }
}

/// Wire protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// Magic + command + length + payload, optional CRC32 trailer.
    BinaryFramed,
    /// One XML element per command/response.
    XmlCommand,
    /// 0x7E-delimited, byte-stuffed frames with a CRC-16 trailer.
    HdlcFramed,
}

impl ProtocolVariant {
    /// Negotiation preference order. HdlcFramed is never negotiated.
    pub const NEGOTIATED: [ProtocolVariant; 2] =
        [ProtocolVariant::BinaryFramed, ProtocolVariant::XmlCommand];

    pub fn max_payload(&self) -> usize {
        match self {
            ProtocolVariant::BinaryFramed => BINARY_MAX_PAYLOAD,
            ProtocolVariant::XmlCommand => XML_MAX_PAYLOAD,
            ProtocolVariant::HdlcFramed => HDLC_MAX_PAYLOAD,
        }
    }

    /// Whether the agent command set has a native sector erase.
    pub fn supports_erase(&self) -> bool {
        !matches!(self, ProtocolVariant::HdlcFramed)
    }

    /// Baud rates to step through after handshake (serial only).
    pub fn baud_sequence(&self) -> &'static [u32] {
        match self {
            ProtocolVariant::HdlcFramed => HDLC_BAUD_SEQUENCE,
            _ => &[],
        }
    }

    pub fn checksum_name(&self) -> &'static str {
        match self {
            ProtocolVariant::BinaryFramed => "CRC32 (negotiated)",
            ProtocolVariant::XmlCommand => "none",
            ProtocolVariant::HdlcFramed => "CRC-16/CCITT",
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::BinaryFramed => write!(f, "BinaryFramed"),
            ProtocolVariant::XmlCommand => write!(f, "XmlCommand"),
            ProtocolVariant::HdlcFramed => write!(f, "HdlcFramed"),
        }
    }
}

/// Codec for one selected variant.
#[derive(Debug, Clone)]
pub enum FrameCodec {
    Binary(BinaryCodec),
    Xml(XmlCodec),
    Hdlc(HdlcCodec),
}

impl FrameCodec {
    /// Codec with default settings (BinaryFramed starts without CRC).
    pub fn for_variant(variant: ProtocolVariant) -> Self {
        match variant {
            ProtocolVariant::BinaryFramed => FrameCodec::Binary(BinaryCodec::new(false)),
            ProtocolVariant::XmlCommand => FrameCodec::Xml(XmlCodec),
            ProtocolVariant::HdlcFramed => FrameCodec::Hdlc(HdlcCodec),
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        match self {
            FrameCodec::Binary(_) => ProtocolVariant::BinaryFramed,
            FrameCodec::Xml(_) => ProtocolVariant::XmlCommand,
            FrameCodec::Hdlc(_) => ProtocolVariant::HdlcFramed,
        }
    }

    /// Enable the negotiated checksum trailer where the variant has one.
    pub fn set_checksum(&mut self, enabled: bool) {
        if let FrameCodec::Binary(codec) = self {
            codec.checksum = enabled;
        }
    }

    pub fn encode(&self, command: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            FrameCodec::Binary(c) => c.encode(command, payload),
            FrameCodec::Xml(c) => c.encode(command, payload),
            FrameCodec::Hdlc(c) => c.encode(command, payload),
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Frame, CodecError> {
        match self {
            FrameCodec::Binary(c) => c.decode(frame),
            FrameCodec::Xml(c) => c.decode(frame),
            FrameCodec::Hdlc(c) => c.decode(frame),
        }
    }

    /// Length of the complete frame at the start of `buf`, `None` if more
    /// bytes are needed.
    pub fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        match self {
            FrameCodec::Binary(c) => c.frame_len(buf),
            FrameCodec::Xml(c) => c.frame_len(buf),
            FrameCodec::Hdlc(c) => c.frame_len(buf),
        }
    }
}
