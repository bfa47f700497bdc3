//! HdlcFramed codec.
//!
//! Layout before stuffing: `id:u16 BE | len:u16 BE | payload | crc16:u16 BE`.
//! The whole body is byte-stuffed (0x7E / 0x7D escaped as 0x7D, b ^ 0x20)
//! and wrapped in 0x7E flags.

use super::{CodecError, Frame};
use crate::protocol::constants::{HDLC_ESCAPE, HDLC_ESCAPE_XOR, HDLC_FLAG, HDLC_MAX_PAYLOAD};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdlcCodec;

/// CRC-16/CCITT (poly 0x1021, init 0x0000, no reflection).
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Escape flag and escape bytes.
pub fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 2);
    for &b in data {
        if b == HDLC_FLAG || b == HDLC_ESCAPE {
            out.push(HDLC_ESCAPE);
            out.push(b ^ HDLC_ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverse of [`stuff`]. A bare flag or a dangling escape is corruption.
pub fn unstuff(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        match b {
            HDLC_ESCAPE => match iter.next() {
                Some(&next) => out.push(next ^ HDLC_ESCAPE_XOR),
                None => {
                    return Err(CodecError::FrameCorruption(
                        "dangling escape byte".into(),
                    ));
                }
            },
            HDLC_FLAG => {
                return Err(CodecError::FrameCorruption(
                    "unescaped flag inside frame".into(),
                ));
            }
            _ => out.push(b),
        }
    }
    Ok(out)
}

impl HdlcCodec {
    pub fn encode(&self, command: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let id = u16::try_from(command).map_err(|_| CodecError::InvalidCommand(command))?;
        if payload.len() > HDLC_MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: HDLC_MAX_PAYLOAD,
            });
        }
        let mut body = Vec::with_capacity(payload.len() + 6);
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(payload);
        let crc = crc16_ccitt(&body);
        body.extend_from_slice(&crc.to_be_bytes());

        let stuffed = stuff(&body);
        let mut frame = Vec::with_capacity(stuffed.len() + 2);
        frame.push(HDLC_FLAG);
        frame.extend_from_slice(&stuffed);
        frame.push(HDLC_FLAG);
        Ok(frame)
    }

    pub fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        match buf.first() {
            None => Ok(None),
            Some(&HDLC_FLAG) => Ok(buf[1..]
                .iter()
                .position(|&b| b == HDLC_FLAG)
                .map(|p| p + 2)),
            Some(&other) => Err(CodecError::FrameCorruption(format!(
                "expected flag byte, got 0x{other:02X}"
            ))),
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Frame, CodecError> {
        if frame.first() != Some(&HDLC_FLAG) {
            return Err(CodecError::FrameCorruption("missing opening flag".into()));
        }
        if frame.len() < 2 || frame.last() != Some(&HDLC_FLAG) {
            return Err(CodecError::Incomplete { have: frame.len() });
        }
        let body = unstuff(&frame[1..frame.len() - 1])?;
        if body.len() < 6 {
            return Err(CodecError::FrameCorruption(format!(
                "body of {} bytes is shorter than header and checksum",
                body.len()
            )));
        }
        let id = u16::from_be_bytes([body[0], body[1]]);
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        if body.len() != len + 6 {
            return Err(CodecError::FrameCorruption(format!(
                "declared length {len} does not match body of {} bytes",
                body.len()
            )));
        }
        let crc_at = 4 + len;
        let expected = u16::from_be_bytes([body[crc_at], body[crc_at + 1]]);
        let actual = crc16_ccitt(&body[..crc_at]);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch {
                expected: expected as u32,
                actual: actual as u32,
            });
        }
        Ok(Frame::new(id as u32, body[4..crc_at].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/XMODEM check value.
        assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_stuffing() {
        assert_eq!(stuff(&[0x01, 0x7E, 0x7D]), vec![0x01, 0x7D, 0x5E, 0x7D, 0x5D]);
        assert_eq!(
            unstuff(&[0x01, 0x7D, 0x5E, 0x7D, 0x5D]).unwrap(),
            vec![0x01, 0x7E, 0x7D]
        );
    }

    #[test]
    fn test_no_flag_inside_encoded_frame() {
        let frame = HdlcCodec.encode(0x7E7D, &[0x7E; 16]).unwrap();
        assert!(
            frame[1..frame.len() - 1]
                .iter()
                .all(|&b| b != HDLC_FLAG)
        );
    }

    #[test]
    fn test_rejects_wide_command() {
        assert_eq!(
            HdlcCodec.encode(0x1_0000, &[]),
            Err(CodecError::InvalidCommand(0x1_0000))
        );
    }

    #[test]
    fn test_dangling_escape() {
        assert!(matches!(
            HdlcCodec.decode(&[0x7E, 0x00, 0x7D, 0x7E]),
            Err(CodecError::FrameCorruption(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = HdlcCodec.encode(0x0001, b"abc").unwrap();
        let idx = frame.len() - 2;
        frame[idx] = if frame[idx] == 0x00 { 0x01 } else { 0x00 };
        assert!(matches!(
            HdlcCodec.decode(&frame),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_len_waits_for_closing_flag() {
        let frame = HdlcCodec.encode(0x0002, b"hello").unwrap();
        assert_eq!(HdlcCodec.frame_len(&frame[..4]).unwrap(), None);
        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        assert_eq!(HdlcCodec.frame_len(&two).unwrap(), Some(frame.len()));
    }
}
