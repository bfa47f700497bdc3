//! Fixed-layout request and response bodies.
//!
//! All multi-byte fields are little-endian. Every response payload starts
//! with a `u32` status word, see [`split_status`].

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), HeaderError> {
    if data.len() < expected {
        return Err(HeaderError::BufferTooSmall {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Split a response payload into its status word and trailing data.
pub fn split_status(payload: &[u8]) -> Result<(u32, &[u8]), HeaderError> {
    ensure_len(payload, 4)?;
    let status = Cursor::new(payload).read_u32::<LittleEndian>()?;
    Ok((status, &payload[4..]))
}

/// Build a response payload from a status word and data.
pub fn with_status(status: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&status.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Identity record returned by IDENTIFY (36 bytes / 0x24).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityHeader {
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub flags: u32,
    pub anti_rollback: u32,
    pub stage: u8,
    pub serial: [u8; 16],
}

impl IdentityHeader {
    pub const SIZE: usize = 36;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.hw_code.to_le_bytes());
        buf.extend_from_slice(&self.hw_sub_code.to_le_bytes());
        buf.extend_from_slice(&self.hw_version.to_le_bytes());
        buf.extend_from_slice(&self.sw_version.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.anti_rollback.to_le_bytes());
        buf.push(self.stage);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.serial);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        let hw_code = cursor.read_u16::<LittleEndian>()?;
        let hw_sub_code = cursor.read_u16::<LittleEndian>()?;
        let hw_version = cursor.read_u16::<LittleEndian>()?;
        let sw_version = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let anti_rollback = cursor.read_u32::<LittleEndian>()?;
        let stage = cursor.read_u8()?;
        let mut serial = [0u8; 16];
        serial.copy_from_slice(&data[20..36]);
        Ok(Self {
            hw_code,
            hw_sub_code,
            hw_version,
            sw_version,
            flags,
            anti_rollback,
            stage,
            serial,
        })
    }
}

/// Sector range addressed by READ / WRITE / ERASE (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectorRequest {
    pub lun: u32,
    pub start_sector: u64,
    pub sector_count: u32,
}

impl SectorRequest {
    pub const SIZE: usize = 16;

    pub fn new(lun: u32, start_sector: u64, sector_count: u32) -> Self {
        Self {
            lun,
            start_sector,
            sector_count,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_into(&mut buf);
        buf
    }

    /// Append the encoded request to `buf` (used to prefix WRITE data).
    pub fn write_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.lun.to_le_bytes());
        buf.extend_from_slice(&self.start_sector.to_le_bytes());
        buf.extend_from_slice(&self.sector_count.to_le_bytes());
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            lun: cursor.read_u32::<LittleEndian>()?,
            start_sector: cursor.read_u64::<LittleEndian>()?,
            sector_count: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// UPLOAD_BEGIN body (13 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadHeader {
    pub address: u64,
    pub length: u32,
    pub stage: u8,
}

impl UploadHeader {
    pub const SIZE: usize = 13;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.push(self.stage);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            address: cursor.read_u64::<LittleEndian>()?,
            length: cursor.read_u32::<LittleEndian>()?,
            stage: cursor.read_u8()?,
        })
    }
}

/// PATCH body: target sector plus a byte offset and the replacement bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    pub lun: u32,
    pub sector: u64,
    pub byte_offset: u32,
    pub value: Vec<u8>,
}

impl PatchRequest {
    pub const FIXED_SIZE: usize = 16;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + self.value.len());
        buf.extend_from_slice(&self.lun.to_le_bytes());
        buf.extend_from_slice(&self.sector.to_le_bytes());
        buf.extend_from_slice(&self.byte_offset.to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::FIXED_SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            lun: cursor.read_u32::<LittleEndian>()?,
            sector: cursor.read_u64::<LittleEndian>()?,
            byte_offset: cursor.read_u32::<LittleEndian>()?,
            value: data[Self::FIXED_SIZE..].to_vec(),
        })
    }
}

/// STORAGE_INFO response data (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub lun_count: u32,
    pub sector_size: u32,
    pub boot_lun: u32,
}

impl StorageInfo {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.lun_count.to_le_bytes());
        buf.extend_from_slice(&self.sector_size.to_le_bytes());
        buf.extend_from_slice(&self.boot_lun.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        let info = Self {
            lun_count: cursor.read_u32::<LittleEndian>()?,
            sector_size: cursor.read_u32::<LittleEndian>()?,
            boot_lun: cursor.read_u32::<LittleEndian>()?,
        };
        if info.sector_size == 0 || !info.sector_size.is_power_of_two() {
            return Err(HeaderError::InvalidField {
                field: "sector_size",
                value: info.sector_size as u64,
            });
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_header_roundtrip() {
        let header = IdentityHeader {
            hw_code: 0x0766,
            hw_sub_code: 0x8A00,
            hw_version: 0xCA00,
            sw_version: 0x0001,
            flags: 0b101,
            anti_rollback: 3,
            stage: 1,
            serial: [0xAB; 16],
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), IdentityHeader::SIZE);
        assert_eq!(IdentityHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_sector_request_short_buffer() {
        let err = SectorRequest::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::BufferTooSmall {
                expected: 16,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_split_status() {
        let payload = with_status(7, b"xyz");
        let (status, data) = split_status(&payload).unwrap();
        assert_eq!(status, 7);
        assert_eq!(data, b"xyz");
    }

    #[test]
    fn test_storage_info_rejects_bad_sector_size() {
        let info = StorageInfo {
            lun_count: 1,
            sector_size: 500,
            boot_lun: 0,
        };
        assert!(StorageInfo::from_bytes(&info.to_bytes()).is_err());
    }
}
