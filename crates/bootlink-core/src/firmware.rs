//! Firmware image sources.
//!
//! A [`FirmwareImageReader`] yields one [`ImageEntry`] per partition image.
//! Entries can feed a batch directly or, when the device has no usable
//! table, define the partition catalog themselves.
//!
//! [`ManifestImageReader`] reads a TOML manifest next to the images:
//!
//! ```toml
//! sector_size = 4096
//! boot_lun = 1
//!
//! [[partition]]
//! name = "boot_a"
//! lun = 0
//! start_sector = 256
//! file = "boot.img"
//!
//! [[patch]]
//! partition = "boot_a"
//! byte_offset = 0x40
//! value = "DEADBEEF"
//! ```

use anyhow::{Context, bail};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{FlashError, Result};
use crate::executor::{Operation, Patch, WriteSource};
use crate::partition::{Partition, PartitionCatalog};
use crate::sparse::{SPARSE_HEADER_SIZE, SparseHeader};

/// One partition image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    pub lun: u32,
    pub start_sector: u64,
    /// Bytes the image covers on the device (expanded size when sparse).
    pub length: u64,
    pub sparse: bool,
    pub path: PathBuf,
}

impl ImageEntry {
    /// Describe an image file, sniffing the sparse header.
    pub fn from_file(name: impl Into<String>, lun: u32, start_sector: u64, path: PathBuf) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut head = [0u8; SPARSE_HEADER_SIZE];
        let sniffed = std::io::Read::read(&mut file, &mut head)?;
        let (sparse, length) = if SparseHeader::is_sparse(&head[..sniffed]) {
            let header = SparseHeader::read_from(&mut &head[..sniffed])?;
            (true, header.expanded_size())
        } else {
            (false, file_len)
        };
        Ok(Self {
            name: name.into(),
            lun,
            start_sector,
            length,
            sparse,
            path,
        })
    }

    pub fn open(&self) -> Result<WriteSource> {
        WriteSource::from_file(&self.path)
    }

    pub fn to_partition(&self, sector_size: u32) -> Partition {
        let mut partition = Partition::new(
            self.name.clone(),
            self.lun,
            self.start_sector,
            self.length.div_ceil(sector_size as u64).max(1),
            sector_size,
        );
        partition.sparse = self.sparse;
        partition
    }

    /// Write operation pinned to this entry's LUN.
    pub fn to_operation(&self) -> Result<Operation> {
        Ok(Operation::write(self.name.clone(), self.open()?).on_lun(self.lun))
    }
}

pub trait FirmwareImageReader {
    fn entries(&self) -> Result<Vec<ImageEntry>>;

    /// Patches to apply after the matching images are written.
    fn patches(&self) -> Vec<Patch> {
        Vec::new()
    }
}

/// Build a catalog from firmware entries, sizing each partition to its
/// image rounded up to whole sectors.
pub fn catalog_from_entries(
    entries: &[ImageEntry],
    sector_size: u32,
    boot_lun: u32,
) -> Result<PartitionCatalog> {
    let partitions = entries.iter().map(|e| e.to_partition(sector_size)).collect();
    Ok(PartitionCatalog::from_partitions(partitions, sector_size, boot_lun)?)
}

#[derive(Debug, Deserialize)]
struct Manifest {
    sector_size: Option<u32>,
    boot_lun: Option<u32>,
    #[serde(default)]
    partition: Vec<ManifestPartition>,
    #[serde(default)]
    patch: Vec<ManifestPatch>,
}

#[derive(Debug, Deserialize)]
struct ManifestPartition {
    name: String,
    #[serde(default)]
    lun: u32,
    start_sector: u64,
    file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ManifestPatch {
    partition: String,
    lun: Option<u32>,
    byte_offset: u64,
    /// Hex-encoded bytes.
    value: String,
}

#[derive(Debug, Clone)]
pub struct ManifestImageReader {
    base: PathBuf,
    partitions: Vec<(String, u32, u64, PathBuf)>,
    patches: Vec<Patch>,
    pub sector_size: Option<u32>,
    pub boot_lun: Option<u32>,
}

impl ManifestImageReader {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading firmware manifest {}", path.display()))?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("parsing firmware manifest {}", path.display()))?;

        let mut patches = Vec::with_capacity(manifest.patch.len());
        for p in manifest.patch {
            let value = hex::decode(p.value.trim())
                .with_context(|| format!("patch for '{}' has invalid hex value", p.partition))?;
            if value.is_empty() {
                bail!("patch for '{}' is empty", p.partition);
            }
            patches.push(Patch {
                partition: p.partition,
                lun: p.lun,
                byte_offset: p.byte_offset,
                value,
            });
        }

        info!(
            manifest = %path.display(),
            partitions = manifest.partition.len(),
            patches = patches.len(),
            "Firmware manifest loaded"
        );
        Ok(Self {
            base: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            partitions: manifest
                .partition
                .into_iter()
                .map(|p| (p.name, p.lun, p.start_sector, p.file))
                .collect(),
            patches,
            sector_size: manifest.sector_size,
            boot_lun: manifest.boot_lun,
        })
    }
}

impl FirmwareImageReader for ManifestImageReader {
    fn entries(&self) -> Result<Vec<ImageEntry>> {
        self.partitions
            .iter()
            .map(|(name, lun, start, file)| {
                ImageEntry::from_file(name.clone(), *lun, *start, self.base.join(file)).map_err(|e| {
                    match e {
                        FlashError::Io(io) => FlashError::Config(format!(
                            "image for '{name}' ({}): {io}",
                            file.display()
                        )),
                        other => other,
                    }
                })
            })
            .collect()
    }

    fn patches(&self) -> Vec<Patch> {
        self.patches.clone()
    }
}
