//! GUID partition table parsing.
//!
//! The table arrives as the first sectors of a LUN: protective MBR at LBA 0,
//! header at LBA 1, entry array wherever the header points. Every length
//! taken from the header is checked against the buffer before use.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::{CatalogError, Partition};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: u32 = 92;
pub const GPT_ENTRY_SIZE: u32 = 128;
/// Upper bound on declared entries.
pub const GPT_MAX_ENTRIES: u32 = 1024;
const NAME_OFFSET: usize = 56;
const NAME_UNITS: usize = 36;

/// Basic data partition type GUID, written for every synthesized entry.
const BASIC_DATA_TYPE: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// Entry input for [`build_gpt`].
#[derive(Debug, Clone)]
pub struct GptEntry {
    pub name: String,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
}

fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Parse the table for `lun`. Unused entries (zero type GUID) are skipped.
pub fn parse_gpt(buf: &[u8], sector_size: u32, lun: u32) -> Result<Vec<Partition>, CatalogError> {
    let header_at = sector_size as usize;
    if buf.len() < header_at + GPT_HEADER_SIZE as usize {
        return Err(CatalogError::Truncated {
            lun,
            have: buf.len(),
        });
    }
    let header = &buf[header_at..];
    if &header[..8] != GPT_SIGNATURE {
        return Err(CatalogError::BadSignature { lun });
    }

    let mut cursor = Cursor::new(&header[8..]);
    let truncated = |_| CatalogError::Truncated {
        lun,
        have: buf.len(),
    };
    let _revision = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let header_size = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let header_crc = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

    if header_size < GPT_HEADER_SIZE || header_size as usize > header.len() {
        return Err(CatalogError::Truncated {
            lun,
            have: buf.len(),
        });
    }
    let mut copy = header[..header_size as usize].to_vec();
    copy[16..20].fill(0);
    if crc32fast::hash(&copy) != header_crc {
        return Err(CatalogError::HeaderCrc { lun });
    }

    let entries_lba = u64::from_le_bytes(header[72..80].try_into().unwrap_or_default());
    let count = read_u32_at(header, 80);
    let entry_size = read_u32_at(header, 84);
    let entries_crc = read_u32_at(header, 88);

    let out_of_bounds = CatalogError::EntryCount {
        lun,
        count,
        entry_size,
    };
    if count > GPT_MAX_ENTRIES || entry_size < GPT_ENTRY_SIZE || entry_size % 8 != 0 {
        return Err(out_of_bounds);
    }
    let entries_at = entries_lba
        .checked_mul(sector_size as u64)
        .and_then(|v| usize::try_from(v).ok());
    let entries_len = (count as usize).checked_mul(entry_size as usize);
    let entries = match (entries_at, entries_len) {
        (Some(at), Some(len)) if at.checked_add(len).is_some_and(|end| end <= buf.len()) => {
            &buf[at..at + len]
        }
        _ => return Err(out_of_bounds),
    };
    if crc32fast::hash(entries) != entries_crc {
        return Err(CatalogError::EntriesCrc { lun });
    }

    let mut partitions = Vec::new();
    for raw in entries.chunks_exact(entry_size as usize) {
        if raw[..16].iter().all(|&b| b == 0) {
            continue;
        }
        let first = u64::from_le_bytes(raw[32..40].try_into().unwrap_or_default());
        let last = u64::from_le_bytes(raw[40..48].try_into().unwrap_or_default());
        let name = decode_name(&raw[NAME_OFFSET..NAME_OFFSET + NAME_UNITS * 2]);
        let Some(count) = last.checked_sub(first).and_then(|d| d.checked_add(1)) else {
            return Err(CatalogError::InvalidEntry {
                lun,
                name,
                reason: format!("invalid LBA range {first}..={last}"),
            });
        };
        partitions.push(Partition::new(name, lun, first, count, sector_size));
    }
    Ok(partitions)
}

/// Serialize a minimal primary GPT (MBR sector, header, entries).
///
/// The entry array is sized to the entries given, rounded up to a whole
/// sector, so the table stays small enough for any variant's frame.
pub fn build_gpt(entries: &[GptEntry], sector_size: u32, total_sectors: u64) -> Vec<u8> {
    let ss = sector_size as usize;
    let per_sector = ss / GPT_ENTRY_SIZE as usize;
    let entry_sectors = entries.len().div_ceil(per_sector).max(1);
    let count = (entry_sectors * per_sector) as u32;

    let mut array = vec![0u8; entry_sectors * ss];
    for (i, entry) in entries.iter().enumerate() {
        let raw = &mut array[i * GPT_ENTRY_SIZE as usize..(i + 1) * GPT_ENTRY_SIZE as usize];
        raw[..16].copy_from_slice(&BASIC_DATA_TYPE);
        raw[16..24].copy_from_slice(&(i as u64 + 1).to_le_bytes());
        raw[32..40].copy_from_slice(&entry.first_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&entry.last_lba.to_le_bytes());
        for (j, unit) in entry.name.encode_utf16().take(NAME_UNITS).enumerate() {
            raw[NAME_OFFSET + j * 2..NAME_OFFSET + j * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    let mut header = Vec::with_capacity(GPT_HEADER_SIZE as usize);
    header.extend_from_slice(GPT_SIGNATURE);
    header.extend_from_slice(&GPT_REVISION.to_le_bytes());
    header.extend_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // header crc, patched below
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&1u64.to_le_bytes());
    header.extend_from_slice(&total_sectors.saturating_sub(1).to_le_bytes());
    header.extend_from_slice(&(2 + entry_sectors as u64).to_le_bytes());
    header.extend_from_slice(
        &total_sectors
            .saturating_sub(2 + entry_sectors as u64)
            .to_le_bytes(),
    );
    header.extend_from_slice(&[0x42; 16]);
    header.extend_from_slice(&2u64.to_le_bytes());
    header.extend_from_slice(&count.to_le_bytes());
    header.extend_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
    header.extend_from_slice(&crc32fast::hash(&array).to_le_bytes());
    let crc = crc32fast::hash(&header);
    header[16..20].copy_from_slice(&crc.to_le_bytes());

    let mut out = vec![0u8; ss];
    // protective MBR signature
    out[510] = 0x55;
    out[511] = 0xAA;
    let mut lba1 = vec![0u8; ss];
    lba1[..header.len()].copy_from_slice(&header);
    out.extend_from_slice(&lba1);
    out.extend_from_slice(&array);
    out
}
