//! Partitions and the per-session partition catalog.

pub mod catalog;
pub mod gpt;

use thiserror::Error;

pub use catalog::PartitionCatalog;
pub use gpt::{GptEntry, build_gpt, parse_gpt};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("no GPT signature on LUN {lun}")]
    BadSignature { lun: u32 },

    #[error("GPT header CRC mismatch on LUN {lun}")]
    HeaderCrc { lun: u32 },

    #[error("GPT entry array CRC mismatch on LUN {lun}")]
    EntriesCrc { lun: u32 },

    #[error("GPT on LUN {lun} declares {count} entries of {entry_size} bytes, exceeding bounds")]
    EntryCount {
        lun: u32,
        count: u32,
        entry_size: u32,
    },

    #[error("GPT header on LUN {lun} is truncated ({have} bytes)")]
    Truncated { lun: u32, have: usize },

    #[error("partitions '{first}' and '{second}' overlap on LUN {lun}")]
    Overlap {
        lun: u32,
        first: String,
        second: String,
    },

    #[error("duplicate partition '{name}' on LUN {lun}")]
    Duplicate { lun: u32, name: String },

    #[error("partition '{name}' on LUN {lun} is invalid: {reason}")]
    InvalidEntry {
        lun: u32,
        name: String,
        reason: String,
    },
}

/// One partition on one LUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub lun: u32,
    pub start_sector: u64,
    pub sector_count: u64,
    pub sector_size: u32,
    /// Image known to be sparse-encoded (firmware import only).
    pub sparse: bool,
}

impl Partition {
    pub fn new(
        name: impl Into<String>,
        lun: u32,
        start_sector: u64,
        sector_count: u64,
        sector_size: u32,
    ) -> Self {
        Self {
            name: name.into(),
            lun,
            start_sector,
            sector_count,
            sector_size,
            sparse: false,
        }
    }

    /// Capacity in bytes, saturating at `u64::MAX`. Catalogs only hold
    /// partitions whose capacity fits.
    pub fn capacity(&self) -> u64 {
        self.sector_count.saturating_mul(self.sector_size as u64)
    }

    /// First sector past the end.
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.sector_count)
    }
}
