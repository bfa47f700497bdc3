//! Acknowledgement codes.
//!
//! Boot ROMs and agents answer staged requests (exploit payloads, agent
//! uploads) with short ASCII codes such as `BYPS` or `RDY1`. The code is
//! carried in the response data after the status word.

use std::fmt;

const MAX_LEN: usize = 8;

/// Acknowledgement code of up to eight bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckCode {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl AckCode {
    /// Take the first eight bytes of `data` as a code.
    pub fn from_bytes(data: &[u8]) -> Self {
        let len = data.len().min(MAX_LEN);
        let mut bytes = [0u8; MAX_LEN];
        bytes[..len].copy_from_slice(&data[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// Four-character code from a big-endian constant (`0x42595053` is `BYPS`).
    pub const fn from_u32(v: u32) -> Self {
        let b = v.to_be_bytes();
        Self {
            bytes: [b[0], b[1], b[2], b[3], 0, 0, 0, 0],
            len: 4,
        }
    }

    /// Wire bytes of the code.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// True when the device answered with no code at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Printable form; non-printable bytes become `.`.
    pub fn as_ascii(&self) -> String {
        self.as_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect()
    }
}

impl fmt::Debug for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckCode({} '{}')", hex::encode_upper(self.as_bytes()), self.as_ascii())
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_ascii())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_constant_and_wire_forms_agree() {
        let ack = AckCode::from_u32(ACK_BYPASSED);
        assert_eq!(ack.as_ascii(), "BYPS");
        assert_eq!(AckCode::from_bytes(b"BYPS"), ack);
        assert_ne!(AckCode::from_bytes(b"DUMP"), ack);
        assert_eq!(AckCode::from_bytes(b"RDY1"), AckCode::from_u32(ACK_READY_FIRST));
    }

    #[test]
    fn test_longer_code_is_not_equal_to_prefix() {
        assert_ne!(AckCode::from_bytes(b"BYPSX"), AckCode::from_u32(ACK_BYPASSED));
    }

    #[test]
    fn test_empty_and_unprintable() {
        assert!(AckCode::from_bytes(&[]).is_empty());
        assert!(!AckCode::from_u32(ACK_BYPASSED).is_empty());
        assert_eq!(AckCode::from_bytes(&[]).as_ascii(), "");
        assert_eq!(AckCode::from_bytes(&[b'E', 0x01, b'R']).to_string(), "E.R");
        assert_eq!(format!("{:?}", AckCode::from_u32(ACK_ERROR_01)), "AckCode(45523031 'ER01')");
    }
}
