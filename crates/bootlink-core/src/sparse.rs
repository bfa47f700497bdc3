//! Android sparse image streaming.
//!
//! [`SparseReader`] walks a sparse image chunk by chunk and hands out
//! [`Segment`]s no larger than the caller's block size, so expanding an
//! image never holds more than one block of data in memory. DONT_CARE
//! regions come out as [`Segment::Skip`] and are not transmitted.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};
use thiserror::Error;

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const SPARSE_HEADER_SIZE: usize = 28;
pub const CHUNK_HEADER_SIZE: usize = 12;

pub const CHUNK_RAW: u16 = 0xCAC1;
pub const CHUNK_FILL: u16 = 0xCAC2;
pub const CHUNK_DONT_CARE: u16 = 0xCAC3;
pub const CHUNK_CRC32: u16 = 0xCAC4;

#[derive(Error, Debug)]
pub enum SparseError {
    #[error("not a sparse image (magic 0x{0:08X})")]
    BadMagic(u32),
    #[error("unsupported sparse version {major}.{minor}")]
    Version { major: u16, minor: u16 },
    #[error("invalid sparse header: {0}")]
    Header(String),
    #[error("chunk {index}: {reason}")]
    Chunk { index: u32, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Sparse file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub file_header_size: u16,
    pub chunk_header_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
}

impl SparseHeader {
    /// Whether `bytes` starts with the sparse magic.
    pub fn is_sparse(bytes: &[u8]) -> bool {
        bytes.len() >= 4 && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPARSE_MAGIC
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, SparseError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SPARSE_MAGIC {
            return Err(SparseError::BadMagic(magic));
        }
        let major = reader.read_u16::<LittleEndian>()?;
        let minor = reader.read_u16::<LittleEndian>()?;
        if major != 1 {
            return Err(SparseError::Version { major, minor });
        }
        let file_header_size = reader.read_u16::<LittleEndian>()?;
        let chunk_header_size = reader.read_u16::<LittleEndian>()?;
        let block_size = reader.read_u32::<LittleEndian>()?;
        let total_blocks = reader.read_u32::<LittleEndian>()?;
        let total_chunks = reader.read_u32::<LittleEndian>()?;
        let _image_checksum = reader.read_u32::<LittleEndian>()?;

        if (file_header_size as usize) < SPARSE_HEADER_SIZE
            || (chunk_header_size as usize) < CHUNK_HEADER_SIZE
        {
            return Err(SparseError::Header(format!(
                "header sizes {file_header_size}/{chunk_header_size} too small"
            )));
        }
        if block_size == 0 || block_size % 4 != 0 {
            return Err(SparseError::Header(format!("block size {block_size}")));
        }
        skip(reader, file_header_size as u64 - SPARSE_HEADER_SIZE as u64)?;

        Ok(Self {
            file_header_size,
            chunk_header_size,
            block_size,
            total_blocks,
            total_chunks,
        })
    }

    /// Size of the expanded image in bytes.
    pub fn expanded_size(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

fn skip<R: Read>(reader: &mut R, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(len), &mut io::sink())?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "sparse image truncated",
        ));
    }
    Ok(())
}

/// A piece of the expanded image at a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Data { offset: u64, bytes: Vec<u8> },
    Fill { offset: u64, pattern: u32, len: u64 },
    Skip { offset: u64, len: u64 },
}

impl Segment {
    pub fn offset(&self) -> u64 {
        match self {
            Segment::Data { offset, .. }
            | Segment::Fill { offset, .. }
            | Segment::Skip { offset, .. } => *offset,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Segment::Data { bytes, .. } => bytes.len() as u64,
            Segment::Fill { len, .. } | Segment::Skip { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remaining part of the chunk being expanded.
#[derive(Debug, Clone, Copy)]
enum Pending {
    None,
    Raw { remaining: u64 },
}

pub struct SparseReader<R: Read> {
    reader: R,
    header: SparseHeader,
    chunk_index: u32,
    offset: u64,
    pending: Pending,
    max_segment: usize,
}

impl<R: Read> SparseReader<R> {
    /// Parse the header; raw data segments are at most `max_segment` bytes.
    pub fn new(mut reader: R, max_segment: usize) -> Result<Self, SparseError> {
        let header = SparseHeader::read_from(&mut reader)?;
        Ok(Self {
            reader,
            header,
            chunk_index: 0,
            offset: 0,
            pending: Pending::None,
            max_segment: max_segment.max(1),
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    fn chunk_error(&self, reason: impl Into<String>) -> SparseError {
        SparseError::Chunk {
            index: self.chunk_index,
            reason: reason.into(),
        }
    }

    /// Next segment, or `None` once every chunk has been consumed.
    pub fn next_segment(&mut self) -> Result<Option<Segment>, SparseError> {
        loop {
            if let Pending::Raw { remaining } = self.pending {
                let take = remaining.min(self.max_segment as u64) as usize;
                let mut bytes = vec![0u8; take];
                self.reader.read_exact(&mut bytes)?;
                let segment = Segment::Data {
                    offset: self.offset,
                    bytes,
                };
                self.offset += take as u64;
                self.pending = if remaining > take as u64 {
                    Pending::Raw {
                        remaining: remaining - take as u64,
                    }
                } else {
                    Pending::None
                };
                return Ok(Some(segment));
            }

            if self.chunk_index >= self.header.total_chunks {
                if self.offset != self.header.expanded_size() {
                    return Err(SparseError::Header(format!(
                        "chunks cover {} bytes, header declares {}",
                        self.offset,
                        self.header.expanded_size()
                    )));
                }
                return Ok(None);
            }

            let chunk_type = self.reader.read_u16::<LittleEndian>()?;
            let _reserved = self.reader.read_u16::<LittleEndian>()?;
            let blocks = self.reader.read_u32::<LittleEndian>()?;
            let total_size = self.reader.read_u32::<LittleEndian>()? as u64;
            skip(
                &mut self.reader,
                self.header.chunk_header_size as u64 - CHUNK_HEADER_SIZE as u64,
            )?;
            let body = total_size
                .checked_sub(self.header.chunk_header_size as u64)
                .ok_or_else(|| self.chunk_error("total size smaller than header"))?;
            let len = blocks as u64 * self.header.block_size as u64;
            if self.offset + len > self.header.expanded_size() {
                return Err(self.chunk_error("chunk extends past declared image size"));
            }

            let segment = match chunk_type {
                CHUNK_RAW => {
                    if body != len {
                        return Err(self.chunk_error(format!("raw body {body} != {len}")));
                    }
                    self.pending = Pending::Raw { remaining: len };
                    None
                }
                CHUNK_FILL => {
                    if body != 4 {
                        return Err(self.chunk_error("fill chunk without 4-byte pattern"));
                    }
                    let pattern = self.reader.read_u32::<LittleEndian>()?;
                    Some(Segment::Fill {
                        offset: self.offset,
                        pattern,
                        len,
                    })
                }
                CHUNK_DONT_CARE => {
                    if body != 0 {
                        return Err(self.chunk_error("don't-care chunk with body"));
                    }
                    Some(Segment::Skip {
                        offset: self.offset,
                        len,
                    })
                }
                CHUNK_CRC32 => {
                    if body != 4 {
                        return Err(self.chunk_error("crc chunk without 4-byte value"));
                    }
                    let _crc = self.reader.read_u32::<LittleEndian>()?;
                    None
                }
                other => return Err(self.chunk_error(format!("unknown type 0x{other:04X}"))),
            };
            self.chunk_index += 1;
            if let Some(segment) = segment {
                self.offset += len;
                return Ok(Some(segment));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Minimal sparse encoder for tests.
    pub(crate) struct SparseBuilder {
        block_size: u32,
        blocks: u32,
        chunks: Vec<Vec<u8>>,
    }

    impl SparseBuilder {
        pub(crate) fn new(block_size: u32) -> Self {
            Self {
                block_size,
                blocks: 0,
                chunks: Vec::new(),
            }
        }

        fn chunk(&mut self, kind: u16, blocks: u32, body: &[u8]) -> &mut Self {
            let mut c = Vec::new();
            c.extend_from_slice(&kind.to_le_bytes());
            c.extend_from_slice(&0u16.to_le_bytes());
            c.extend_from_slice(&blocks.to_le_bytes());
            c.extend_from_slice(&((CHUNK_HEADER_SIZE + body.len()) as u32).to_le_bytes());
            c.extend_from_slice(body);
            self.chunks.push(c);
            if kind != CHUNK_CRC32 {
                self.blocks += blocks;
            }
            self
        }

        pub(crate) fn raw(&mut self, data: &[u8]) -> &mut Self {
            let blocks = data.len() as u32 / self.block_size;
            self.chunk(CHUNK_RAW, blocks, data)
        }

        pub(crate) fn fill(&mut self, pattern: u32, blocks: u32) -> &mut Self {
            self.chunk(CHUNK_FILL, blocks, &pattern.to_le_bytes())
        }

        pub(crate) fn dont_care(&mut self, blocks: u32) -> &mut Self {
            self.chunk(CHUNK_DONT_CARE, blocks, &[])
        }

        pub(crate) fn crc(&mut self) -> &mut Self {
            self.chunk(CHUNK_CRC32, 0, &[0; 4])
        }

        pub(crate) fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&SPARSE_MAGIC.to_le_bytes());
            out.extend_from_slice(&1u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&(SPARSE_HEADER_SIZE as u16).to_le_bytes());
            out.extend_from_slice(&(CHUNK_HEADER_SIZE as u16).to_le_bytes());
            out.extend_from_slice(&self.block_size.to_le_bytes());
            out.extend_from_slice(&self.blocks.to_le_bytes());
            out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            for c in &self.chunks {
                out.extend_from_slice(c);
            }
            out
        }
    }

    #[test]
    fn test_segments_in_order() {
        let image = SparseBuilder::new(4096)
            .raw(&[0xAA; 8192])
            .fill(0x1122_3344, 2)
            .crc()
            .dont_care(3)
            .build();
        let mut reader = SparseReader::new(Cursor::new(image), 4096).unwrap();
        assert_eq!(reader.header().expanded_size(), 7 * 4096);

        let mut segments = Vec::new();
        while let Some(s) = reader.next_segment().unwrap() {
            segments.push(s);
        }
        assert_eq!(segments.len(), 4);
        assert!(matches!(&segments[0], Segment::Data { offset: 0, bytes } if bytes.len() == 4096));
        assert_eq!(segments[1].offset(), 4096);
        assert_eq!(
            segments[2],
            Segment::Fill {
                offset: 8192,
                pattern: 0x1122_3344,
                len: 8192
            }
        );
        assert_eq!(
            segments[3],
            Segment::Skip {
                offset: 16384,
                len: 3 * 4096
            }
        );
    }

    #[test]
    fn test_huge_dont_care_is_not_materialized() {
        // 1 GiB declared, a few bytes on disk.
        let image = SparseBuilder::new(4096)
            .raw(&[7; 4096])
            .dont_care(262_143)
            .build();
        assert!(image.len() < 4096 + 128);
        let mut reader = SparseReader::new(Cursor::new(image), 1 << 20).unwrap();
        assert_eq!(reader.header().expanded_size(), 1 << 30);
        let first = reader.next_segment().unwrap().unwrap();
        assert_eq!(first.len(), 4096);
        let second = reader.next_segment().unwrap().unwrap();
        assert_eq!(second.len(), (1 << 30) - 4096);
        assert!(matches!(second, Segment::Skip { .. }));
        assert!(reader.next_segment().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            SparseReader::new(Cursor::new(vec![0u8; 28]), 512),
            Err(SparseError::BadMagic(0))
        ));
        assert!(!SparseHeader::is_sparse(b"ANDROID!"));
    }

    #[test]
    fn test_chunk_overrun_rejected() {
        let mut image = SparseBuilder::new(4096).dont_care(1).build();
        // declare fewer blocks than the chunks cover
        image[16..20].copy_from_slice(&0u32.to_le_bytes());
        let mut reader = SparseReader::new(Cursor::new(image), 4096).unwrap();
        assert!(matches!(
            reader.next_segment(),
            Err(SparseError::Chunk { index: 0, .. })
        ));
    }
}
