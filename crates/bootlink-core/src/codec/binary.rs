//! BinaryFramed codec.
//!
//! Layout: `magic:u32 | command:u32 | length:u32 | payload | [crc32:u32]`,
//! all little-endian. The CRC32 trailer covers every preceding byte and is
//! only present once the device has advertised checksum support.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::{CodecError, Frame};
use crate::protocol::constants::{BINARY_HEADER_SIZE, BINARY_MAGIC, BINARY_MAX_PAYLOAD};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryCodec {
    /// Append / validate the CRC32 trailer.
    pub checksum: bool,
}

impl BinaryCodec {
    pub fn new(checksum: bool) -> Self {
        Self { checksum }
    }

    fn trailer_len(&self) -> usize {
        if self.checksum { 4 } else { 0 }
    }

    pub fn encode(&self, command: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        if payload.len() > BINARY_MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: BINARY_MAX_PAYLOAD,
            });
        }
        let mut frame =
            Vec::with_capacity(BINARY_HEADER_SIZE + payload.len() + self.trailer_len());
        frame.extend_from_slice(&BINARY_MAGIC.to_le_bytes());
        frame.extend_from_slice(&command.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        if self.checksum {
            let crc = crc32fast::hash(&frame);
            frame.extend_from_slice(&crc.to_le_bytes());
        }
        Ok(frame)
    }

    /// Parse the header, returning (command, payload length).
    fn header(&self, buf: &[u8]) -> Result<Option<(u32, usize)>, CodecError> {
        if buf.len() < BINARY_HEADER_SIZE {
            return Ok(None);
        }
        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u32::<LittleEndian>().unwrap_or_default();
        if magic != BINARY_MAGIC {
            return Err(CodecError::FrameCorruption(format!(
                "bad magic 0x{magic:08X}"
            )));
        }
        let command = cursor.read_u32::<LittleEndian>().unwrap_or_default();
        let len = cursor.read_u32::<LittleEndian>().unwrap_or_default() as usize;
        if len > BINARY_MAX_PAYLOAD {
            return Err(CodecError::FrameCorruption(format!(
                "declared length {len} exceeds maximum {BINARY_MAX_PAYLOAD}"
            )));
        }
        Ok(Some((command, len)))
    }

    pub fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        let Some((_, len)) = self.header(buf)? else {
            return Ok(None);
        };
        let total = BINARY_HEADER_SIZE + len + self.trailer_len();
        Ok((buf.len() >= total).then_some(total))
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Frame, CodecError> {
        let Some((command, len)) = self.header(frame)? else {
            return Err(CodecError::Incomplete { have: frame.len() });
        };
        let body_end = BINARY_HEADER_SIZE + len;
        let total = body_end + self.trailer_len();
        if frame.len() < total {
            return Err(CodecError::Incomplete { have: frame.len() });
        }
        if frame.len() > total {
            return Err(CodecError::FrameCorruption(format!(
                "{} trailing bytes after frame",
                frame.len() - total
            )));
        }
        if self.checksum {
            let expected = u32::from_le_bytes([
                frame[body_end],
                frame[body_end + 1],
                frame[body_end + 2],
                frame[body_end + 3],
            ]);
            let actual = crc32fast::hash(&frame[..body_end]);
            if expected != actual {
                return Err(CodecError::ChecksumMismatch { expected, actual });
            }
        }
        Ok(Frame::new(
            command,
            frame[BINARY_HEADER_SIZE..body_end].to_vec(),
        ))
    }
}
