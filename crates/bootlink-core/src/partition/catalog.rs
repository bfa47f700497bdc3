//! Validated, immutable partition catalog.
//!
//! A catalog is built whole and then shared behind an `Arc`; refreshing a
//! session's catalog swaps the `Arc`, so readers only ever see a complete
//! table.

use std::collections::{BTreeMap, HashSet};

use super::{CatalogError, Partition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCatalog {
    luns: BTreeMap<u32, Vec<Partition>>,
    sector_size: u32,
    boot_lun: u32,
}

impl PartitionCatalog {
    /// Validate and index partitions.
    ///
    /// Within each LUN partitions are sorted by start sector; any overlap or
    /// duplicate (LUN, name) is rejected.
    pub fn from_partitions(
        partitions: Vec<Partition>,
        sector_size: u32,
        boot_lun: u32,
    ) -> Result<Self, CatalogError> {
        let mut luns: BTreeMap<u32, Vec<Partition>> = BTreeMap::new();
        for p in partitions {
            if p.sector_count == 0 {
                return Err(CatalogError::InvalidEntry {
                    lun: p.lun,
                    name: p.name,
                    reason: "zero sectors".into(),
                });
            }
            if p.start_sector.checked_add(p.sector_count).is_none() {
                return Err(CatalogError::InvalidEntry {
                    lun: p.lun,
                    name: p.name,
                    reason: "sector range overflows".into(),
                });
            }
            if p.sector_count.checked_mul(p.sector_size as u64).is_none() {
                return Err(CatalogError::InvalidEntry {
                    lun: p.lun,
                    name: p.name,
                    reason: format!(
                        "{} sectors of {} bytes overflow a byte size",
                        p.sector_count, p.sector_size
                    ),
                });
            }
            luns.entry(p.lun).or_default().push(p);
        }

        for (&lun, parts) in luns.iter_mut() {
            parts.sort_by_key(|p| p.start_sector);

            let mut names = HashSet::new();
            for p in parts.iter() {
                if !names.insert(p.name.as_str()) {
                    return Err(CatalogError::Duplicate {
                        lun,
                        name: p.name.clone(),
                    });
                }
            }
            for pair in parts.windows(2) {
                if pair[0].end_sector() > pair[1].start_sector {
                    return Err(CatalogError::Overlap {
                        lun,
                        first: pair[0].name.clone(),
                        second: pair[1].name.clone(),
                    });
                }
            }
        }

        Ok(Self {
            luns,
            sector_size,
            boot_lun,
        })
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn boot_lun(&self) -> u32 {
        self.boot_lun
    }

    /// Look up by name, optionally restricted to one LUN. Without a LUN the
    /// lowest LUN holding the name wins.
    pub fn find(&self, name: &str, lun: Option<u32>) -> Option<&Partition> {
        match lun {
            Some(lun) => self.luns.get(&lun)?.iter().find(|p| p.name == name),
            None => self.iter().find(|p| p.name == name),
        }
    }

    /// Partitions on one LUN, sorted by start sector.
    pub fn lun(&self, lun: u32) -> &[Partition] {
        self.luns.get(&lun).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn luns(&self) -> impl Iterator<Item = u32> + '_ {
        self.luns.keys().copied()
    }

    /// All partitions ordered by (LUN, start sector).
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.luns.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.luns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of partition capacities in bytes.
    pub fn total_capacity(&self) -> u64 {
        self.iter()
            .map(Partition::capacity)
            .fold(0u64, u64::saturating_add)
    }
}
