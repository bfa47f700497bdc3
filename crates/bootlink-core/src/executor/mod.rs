//! Partition I/O: read, write, erase, patch and batches.
//!
//! Transfers are split into blocks of whole sectors. Between blocks the
//! executor reports progress and polls the session's [`CancelToken`].

pub mod batch;
pub mod source;

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::auth::AuthLevel;
use crate::error::{FlashError, Result};
use crate::events::FlashObserver;
use crate::link::DeviceLink;
use crate::partition::{Partition, PartitionCatalog};
use crate::protocol::constants::{
    CMD_ERASE, CMD_PATCH, CMD_READ, CMD_WRITE, SECTOR_REQUEST_HEADER, STATUS_NOT_AUTHORIZED,
};
use crate::protocol::{PatchRequest, SectorRequest};
use crate::sparse::{Segment, SparseHeader, SparseReader};

pub use batch::{BatchEntry, BatchReport, Operation, OperationKind, OperationOutcome, Patch};
pub use source::WriteSource;

/// Shared cancellation flag, polled at block boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before starting a new operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Result of a read. A cancelled read reports the bytes already delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on a transfer block; clamped to the variant's frame size.
    pub block_size: usize,
    pub io_timeout: Duration,
    /// Added to `io_timeout` per KiB of block data.
    pub io_timeout_per_kib: Duration,
    pub erase_timeout: Duration,
    pub protected_partitions: Vec<String>,
    /// Overrides the device-reported boot LUN.
    pub boot_lun: Option<u32>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            io_timeout: Duration::from_secs(2),
            io_timeout_per_kib: Duration::from_millis(2),
            erase_timeout: Duration::from_secs(60),
            protected_partitions: default_protected_partitions(),
            boot_lun: None,
        }
    }
}

pub fn default_protected_partitions() -> Vec<String> {
    ["nvram", "nvdata", "proinfo", "persist", "seccfg", "frp", "efuse"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub struct Executor<'a> {
    link: &'a mut DeviceLink,
    catalog: &'a PartitionCatalog,
    config: &'a ExecutorConfig,
    observer: &'a dyn FlashObserver,
    cancel: &'a CancelToken,
    auth_level: AuthLevel,
}

impl<'a> Executor<'a> {
    pub fn new(
        link: &'a mut DeviceLink,
        catalog: &'a PartitionCatalog,
        config: &'a ExecutorConfig,
        observer: &'a dyn FlashObserver,
        cancel: &'a CancelToken,
        auth_level: AuthLevel,
    ) -> Self {
        Self {
            link,
            catalog,
            config,
            observer,
            cancel,
            auth_level,
        }
    }

    pub fn catalog(&self) -> &PartitionCatalog {
        self.catalog
    }

    /// Sectors per transfer block for `partition`.
    pub fn block_sectors(&self, partition: &Partition) -> u64 {
        let max = self
            .link
            .variant()
            .max_payload()
            .saturating_sub(SECTOR_REQUEST_HEADER);
        let bytes = self.config.block_size.min(max) as u64;
        (bytes / partition.sector_size as u64).max(1)
    }

    fn timeout_for(&self, bytes: u64) -> Duration {
        self.config.io_timeout + self.config.io_timeout_per_kib * (bytes / 1024) as u32
    }

    fn is_protected(&self, partition: &Partition) -> bool {
        self.config
            .protected_partitions
            .iter()
            .any(|p| p == &partition.name)
    }

    fn authorize(&self, partition: &Partition) -> Result<()> {
        if self.is_protected(partition) && self.auth_level < AuthLevel::Vendor {
            return Err(FlashError::NotAuthorized {
                partition: partition.name.clone(),
                context: self.link.context(),
            });
        }
        Ok(())
    }

    /// Issue a sector command, mapping an authorization status to
    /// `NotAuthorized` for `partition`.
    fn sector_command(
        &mut self,
        partition: &Partition,
        command: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        match self.link.transact(command, payload, timeout) {
            Err(FlashError::DeviceError {
                status: STATUS_NOT_AUTHORIZED,
                context,
            }) => Err(FlashError::NotAuthorized {
                partition: partition.name.clone(),
                context,
            }),
            other => other,
        }
    }

    /// Read up to `limit` bytes (default: whole partition) into `dest`.
    #[instrument(skip(self, partition, dest), fields(partition = %partition.name, lun = partition.lun))]
    pub fn read(
        &mut self,
        partition: &Partition,
        dest: &mut dyn Write,
        limit: Option<u64>,
    ) -> Result<ReadOutcome> {
        self.authorize(partition)?;
        let capacity = partition.capacity();
        let total = limit.map_or(capacity, |l| l.min(capacity));
        let ss = partition.sector_size as u64;
        let block = self.block_sectors(partition) * ss;
        let operation = format!("read {}", partition.name);

        let mut done = 0u64;
        self.observer.on_progress(&operation, 0, total);
        while done < total {
            if self.cancel.is_cancelled() {
                info!(done, total, "Read cancelled");
                return Ok(ReadOutcome {
                    bytes: done,
                    cancelled: true,
                });
            }
            let want = (total - done).min(block);
            let sectors = want.div_ceil(ss);
            let request =
                SectorRequest::new(partition.lun, partition.start_sector + done / ss, sectors as u32);
            let data = self.sector_command(
                partition,
                CMD_READ,
                &request.to_bytes(),
                self.timeout_for(sectors * ss),
            )?;
            if (data.len() as u64) < want {
                return Err(FlashError::FrameCorruption {
                    detail: format!("short read: {} of {want} bytes", data.len()),
                    context: self.link.context(),
                });
            }
            dest.write_all(&data[..want as usize])?;
            done += want;
            self.observer.on_progress(&operation, done, total);
        }
        Ok(ReadOutcome {
            bytes: done,
            cancelled: false,
        })
    }

    /// Write sectors starting `sector_offset` sectors into the partition.
    /// `data` is zero-padded to a whole sector.
    fn write_sectors(&mut self, partition: &Partition, sector_offset: u64, data: &[u8]) -> Result<()> {
        let ss = partition.sector_size as usize;
        let block = self.block_sectors(partition) as usize * ss;
        for (i, piece) in data.chunks(block).enumerate() {
            let sectors = piece.len().div_ceil(ss);
            let first = sector_offset + (i * block / ss) as u64;
            let mut payload = Vec::with_capacity(SECTOR_REQUEST_HEADER + sectors * ss);
            SectorRequest::new(partition.lun, partition.start_sector + first, sectors as u32)
                .write_into(&mut payload);
            payload.extend_from_slice(piece);
            payload.resize(SECTOR_REQUEST_HEADER + sectors * ss, 0);
            self.sector_command(
                partition,
                CMD_WRITE,
                &payload,
                self.timeout_for((sectors * ss) as u64),
            )?;
        }
        Ok(())
    }

    /// Write `source` to the start of the partition. Returns the number of
    /// image bytes covered (the expanded size for sparse sources).
    #[instrument(skip(self, partition, source), fields(partition = %partition.name, lun = partition.lun))]
    pub fn write(&mut self, partition: &Partition, source: WriteSource) -> Result<u64> {
        self.authorize(partition)?;
        let (head, reader, len) = source.peek_header()?;
        if SparseHeader::is_sparse(&head) {
            let chained = std::io::Cursor::new(head).chain(reader);
            self.write_sparse(partition, chained)
        } else {
            if len > partition.capacity() {
                return Err(FlashError::SizeMismatch {
                    partition: partition.name.clone(),
                    size: len,
                    capacity: partition.capacity(),
                });
            }
            let chained = std::io::Cursor::new(head).chain(reader).take(len);
            self.write_raw(partition, chained, len)
        }
    }

    fn write_raw(&mut self, partition: &Partition, mut reader: impl Read, len: u64) -> Result<u64> {
        let ss = partition.sector_size as u64;
        let block = (self.block_sectors(partition) * ss) as usize;
        let operation = format!("write {}", partition.name);
        let mut buf = vec![0u8; block];
        let mut done = 0u64;

        self.observer.on_progress(&operation, 0, len);
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            self.write_sectors(partition, done / ss, &buf[..n])?;
            done += n as u64;
            self.observer.on_progress(&operation, done, len);
            if n < block {
                break;
            }
        }
        debug!(bytes = done, "Raw write complete");
        Ok(done)
    }

    fn write_sparse(&mut self, partition: &Partition, reader: impl Read) -> Result<u64> {
        let ss = partition.sector_size as u64;
        let block = (self.block_sectors(partition) * ss) as usize;
        let mut sparse = SparseReader::new(reader, block)?;
        let header = *sparse.header();
        let total = header.expanded_size();
        if total > partition.capacity() {
            return Err(FlashError::SizeMismatch {
                partition: partition.name.clone(),
                size: total,
                capacity: partition.capacity(),
            });
        }
        if header.block_size as u64 % ss != 0 {
            return Err(FlashError::InvalidImage(format!(
                "sparse block size {} is not a multiple of the {ss}-byte sector",
                header.block_size
            )));
        }
        info!(
            expanded = total,
            blocks = header.total_blocks,
            chunks = header.total_chunks,
            "Writing sparse image"
        );

        let operation = format!("write {}", partition.name);
        self.observer.on_progress(&operation, 0, total);
        while let Some(segment) = sparse.next_segment()? {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            match &segment {
                Segment::Data { offset, bytes } => {
                    self.write_sectors(partition, offset / ss, bytes)?;
                }
                Segment::Fill {
                    offset,
                    pattern,
                    len,
                } => {
                    let piece_len = (*len).min(block as u64) as usize;
                    let piece: Vec<u8> = pattern
                        .to_le_bytes()
                        .iter()
                        .copied()
                        .cycle()
                        .take(piece_len)
                        .collect();
                    let mut written = 0u64;
                    while written < *len {
                        if self.cancel.is_cancelled() {
                            return Err(FlashError::Cancelled);
                        }
                        let n = (*len - written).min(piece_len as u64) as usize;
                        self.write_sectors(partition, (offset + written) / ss, &piece[..n])?;
                        written += n as u64;
                    }
                }
                Segment::Skip { offset, len } => {
                    debug!(offset, len, "Clearing don't-care region");
                    self.clear_sectors(partition, offset / ss, len / ss, None)?;
                }
            }
            self.observer
                .on_progress(&operation, segment.offset() + segment.len(), total);
        }
        Ok(total)
    }

    /// Erase with the native command, or by writing zeros where the variant
    /// has none.
    #[instrument(skip(self, partition), fields(partition = %partition.name, lun = partition.lun))]
    pub fn erase(&mut self, partition: &Partition) -> Result<u64> {
        self.authorize(partition)?;
        let operation = format!("erase {}", partition.name);
        let capacity = partition.capacity();

        if !self.link.variant().supports_erase() {
            info!(variant = %self.link.variant(), "No erase command, writing zeros");
        }
        self.clear_sectors(partition, 0, partition.sector_count, Some(&operation))?;
        Ok(capacity)
    }

    /// Zero `count` sectors starting at `first` (relative to the partition),
    /// natively where the variant can erase.
    fn clear_sectors(
        &mut self,
        partition: &Partition,
        first: u64,
        count: u64,
        operation: Option<&str>,
    ) -> Result<()> {
        let ss = partition.sector_size as u64;
        let total = count * ss;
        if self.link.variant().supports_erase() {
            let mut done = 0u64;
            while done < count {
                let n = (count - done).min(u32::MAX as u64);
                let request = SectorRequest::new(
                    partition.lun,
                    partition.start_sector + first + done,
                    n as u32,
                );
                self.sector_command(
                    partition,
                    CMD_ERASE,
                    &request.to_bytes(),
                    self.config.erase_timeout,
                )?;
                done += n;
            }
            if let Some(operation) = operation {
                self.observer.on_progress(operation, total, total);
            }
            return Ok(());
        }

        let block_sectors = self.block_sectors(partition);
        let zeros = vec![0u8; (block_sectors * ss) as usize];
        let mut done = 0u64;
        while done < count {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }
            let n = (count - done).min(block_sectors);
            self.write_sectors(partition, first + done, &zeros[..(n * ss) as usize])?;
            done += n;
            if let Some(operation) = operation {
                self.observer.on_progress(operation, done * ss, total);
            }
        }
        Ok(())
    }

    /// Apply one position+value edit inside the partition.
    pub fn apply_patch(&mut self, partition: &Partition, byte_offset: u64, value: &[u8]) -> Result<()> {
        self.authorize(partition)?;
        let end = byte_offset.checked_add(value.len() as u64);
        if end.is_none_or(|end| end > partition.capacity()) {
            return Err(FlashError::SizeMismatch {
                partition: partition.name.clone(),
                size: byte_offset.saturating_add(value.len() as u64),
                capacity: partition.capacity(),
            });
        }
        let ss = partition.sector_size as u64;
        let request = PatchRequest {
            lun: partition.lun,
            sector: partition.start_sector + byte_offset / ss,
            byte_offset: (byte_offset % ss) as u32,
            value: value.to_vec(),
        };
        debug!(
            partition = %partition.name,
            sector = request.sector,
            offset = request.byte_offset,
            len = value.len(),
            "Applying patch"
        );
        self.sector_command(partition, CMD_PATCH, &request.to_bytes(), self.config.io_timeout)?;
        Ok(())
    }
}

/// Fill `buf` from `reader` until full or end of stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn test_read_full_across_short_reads() {
        struct Dribble(Vec<u8>);
        impl Read for Dribble {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0.remove(0);
                Ok(1)
            }
        }
        let mut buf = [0u8; 4];
        let mut src = Dribble(vec![1, 2, 3, 4, 5]);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 1);
    }

    #[test]
    fn test_default_protected_list() {
        let list = default_protected_partitions();
        assert!(list.iter().any(|p| p == "nvram"));
        assert_eq!(list.len(), 7);
    }
}
