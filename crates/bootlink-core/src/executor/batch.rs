//! Ordered batches of partition operations.
//!
//! A batch is resolved against the catalog up front, sorted by
//! (LUN, start sector) and executed sequentially. The first failure stops
//! the batch; the remaining operations are reported as skipped.

use std::fmt;
use std::io::Write;
use tracing::info;

use super::{Executor, WriteSource};
use crate::error::{FlashError, Result};
use crate::events::{FlashPhase, LogLevel};
use crate::partition::Partition;
use crate::protocol::constants::CMD_SET_BOOT_LUN;

pub enum OperationKind {
    Read {
        dest: Box<dyn Write + Send>,
        limit: Option<u64>,
    },
    Write(WriteSource),
    Erase,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Read { .. } => "read",
            OperationKind::Write(_) => "write",
            OperationKind::Erase => "erase",
        }
    }

    pub fn phase(&self) -> FlashPhase {
        match self {
            OperationKind::Read { .. } => FlashPhase::Reading,
            OperationKind::Write(_) => FlashPhase::Writing,
            OperationKind::Erase => FlashPhase::Erasing,
        }
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read { limit, .. } => f.debug_struct("Read").field("limit", limit).finish(),
            OperationKind::Write(source) => f.debug_tuple("Write").field(source).finish(),
            OperationKind::Erase => f.write_str("Erase"),
        }
    }
}

/// One partition operation. Without a LUN the partition name is looked up
/// across all LUNs.
#[derive(Debug)]
pub struct Operation {
    pub partition: String,
    pub lun: Option<u32>,
    pub kind: OperationKind,
}

impl Operation {
    pub fn read(partition: impl Into<String>, dest: impl Write + Send + 'static) -> Self {
        Self {
            partition: partition.into(),
            lun: None,
            kind: OperationKind::Read {
                dest: Box::new(dest),
                limit: None,
            },
        }
    }

    pub fn write(partition: impl Into<String>, source: WriteSource) -> Self {
        Self {
            partition: partition.into(),
            lun: None,
            kind: OperationKind::Write(source),
        }
    }

    pub fn erase(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            lun: None,
            kind: OperationKind::Erase,
        }
    }

    pub fn on_lun(mut self, lun: u32) -> Self {
        self.lun = Some(lun);
        self
    }
}

/// A small edit applied right after the matching partition is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub partition: String,
    pub lun: Option<u32>,
    pub byte_offset: u64,
    pub value: Vec<u8>,
}

#[derive(Debug)]
pub enum OperationOutcome {
    Completed { bytes: u64 },
    Failed { error: FlashError },
    Skipped,
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, OperationOutcome::Completed { .. })
    }
}

#[derive(Debug)]
pub struct BatchEntry {
    pub partition: String,
    pub lun: u32,
    pub operation: &'static str,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// In execution order.
    pub entries: Vec<BatchEntry>,
    pub patches_applied: usize,
    /// Patches whose partition was not written in this batch.
    pub skipped_patches: Vec<Patch>,
    /// LUN activated for boot, if the batch touched more than one LUN.
    pub boot_lun_activated: Option<u32>,
    /// Why activating the boot LUN failed after all writes went through.
    pub boot_lun_error: Option<FlashError>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|e| e.outcome.is_completed()) && self.boot_lun_error.is_none()
    }

    pub fn first_failure(&self) -> Option<&BatchEntry> {
        self.entries
            .iter()
            .find(|e| matches!(e.outcome, OperationOutcome::Failed { .. }))
    }

    /// First error that ends the session (failed operation or boot LUN).
    pub fn fatal_error(&self) -> Option<&FlashError> {
        let failed = self.first_failure().and_then(|e| match &e.outcome {
            OperationOutcome::Failed { error } => Some(error),
            _ => None,
        });
        failed
            .into_iter()
            .chain(self.boot_lun_error.as_ref())
            .find(|e| e.is_fatal())
    }
}

impl Executor<'_> {
    /// Run `operations` and then `patches` in catalog order.
    ///
    /// Any unknown partition rejects the whole batch before I/O starts.
    pub fn run_batch(
        &mut self,
        operations: Vec<Operation>,
        patches: Vec<Patch>,
        mut on_phase: impl FnMut(FlashPhase),
    ) -> Result<BatchReport> {
        let mut resolved: Vec<(Partition, OperationKind)> = Vec::with_capacity(operations.len());
        for op in operations {
            let partition = self
                .catalog()
                .find(&op.partition, op.lun)
                .cloned()
                .ok_or_else(|| FlashError::UnknownPartition {
                    name: op.partition.clone(),
                })?;
            resolved.push((partition, op.kind));
        }
        resolved.sort_by_key(|(p, _)| (p.lun, p.start_sector));

        let mut pending_patches: Vec<(Patch, bool)> =
            patches.into_iter().map(|p| (p, false)).collect();
        let mut report = BatchReport::default();
        let mut written_luns = Vec::new();
        let mut failed = false;

        info!(operations = resolved.len(), patches = pending_patches.len(), "Running batch");
        for (partition, kind) in resolved {
            let operation = kind.name();
            if failed {
                report.entries.push(BatchEntry {
                    partition: partition.name,
                    lun: partition.lun,
                    operation,
                    outcome: OperationOutcome::Skipped,
                });
                continue;
            }

            on_phase(kind.phase());
            let is_write = matches!(kind, OperationKind::Write(_));
            let mut result = match kind {
                OperationKind::Read { mut dest, limit } => {
                    self.read(&partition, &mut dest, limit).and_then(|outcome| {
                        if outcome.cancelled {
                            Err(FlashError::Cancelled)
                        } else {
                            Ok(outcome.bytes)
                        }
                    })
                }
                OperationKind::Write(source) => self.write(&partition, source),
                OperationKind::Erase => self.erase(&partition),
            };

            if is_write && result.is_ok() {
                if !written_luns.contains(&partition.lun) {
                    written_luns.push(partition.lun);
                }
                for (patch, applied) in pending_patches.iter_mut() {
                    if *applied || patch.partition != partition.name {
                        continue;
                    }
                    if patch.lun.is_some_and(|lun| lun != partition.lun) {
                        continue;
                    }
                    on_phase(FlashPhase::Patching);
                    if let Err(e) = self.apply_patch(&partition, patch.byte_offset, &patch.value) {
                        result = Err(e);
                        break;
                    }
                    *applied = true;
                    report.patches_applied += 1;
                }
            }

            let outcome = match result {
                Ok(bytes) => OperationOutcome::Completed { bytes },
                Err(error) => {
                    self.observer.on_log(
                        LogLevel::Warn,
                        &format!(
                            "{} of '{}' on LUN {} failed: {}",
                            operation, partition.name, partition.lun, error
                        ),
                    );
                    failed = true;
                    OperationOutcome::Failed { error }
                }
            };
            report.entries.push(BatchEntry {
                partition: partition.name,
                lun: partition.lun,
                operation,
                outcome,
            });
        }

        for (patch, applied) in pending_patches {
            if !applied {
                if !failed {
                    self.observer.on_log(
                        LogLevel::Warn,
                        &format!(
                            "patch for '{}' skipped: partition not written in this batch",
                            patch.partition
                        ),
                    );
                }
                report.skipped_patches.push(patch);
            }
        }

        if !failed && written_luns.len() > 1 {
            let lun = self
                .config
                .boot_lun
                .unwrap_or_else(|| self.catalog().boot_lun());
            info!(lun, "Activating boot LUN");
            match self
                .link
                .transact(CMD_SET_BOOT_LUN, &lun.to_le_bytes(), self.config.io_timeout)
            {
                Ok(_) => report.boot_lun_activated = Some(lun),
                Err(error) => {
                    self.observer.on_log(
                        LogLevel::Warn,
                        &format!("activating boot LUN {} failed: {}", lun, error),
                    );
                    report.boot_lun_error = Some(error);
                }
            }
        }
        Ok(report)
    }
}
