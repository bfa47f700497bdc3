//! Exploit descriptors keyed by hardware code.
//!
//! The table is loaded once from a TOML manifest and shared read-only
//! between sessions:
//!
//! ```toml
//! [[exploit]]
//! name = "brom-bypass"
//! hw_code = 0x0766
//! stage = "boot_rom"
//! kind = "bypass"
//! payload = "payloads/0766.bin"
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::chip::ExecutionStage;
use crate::protocol::AckCode;
use crate::protocol::constants::{ACK_BYPASSED, ACK_DIAG_DUMP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExploitKind {
    /// Disables signature verification; answered with `BYPS`.
    Bypass,
    /// Only dumps diagnostics; answered with `DUMP`.
    DiagnosticDump,
}

impl ExploitKind {
    pub fn expected_ack(&self) -> AckCode {
        match self {
            ExploitKind::Bypass => AckCode::from_u32(ACK_BYPASSED),
            ExploitKind::DiagnosticDump => AckCode::from_u32(ACK_DIAG_DUMP),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploitDescriptor {
    pub name: String,
    pub hw_code: u16,
    pub target_stage: ExecutionStage,
    pub kind: ExploitKind,
    pub payload: Vec<u8>,
}

impl ExploitDescriptor {
    pub fn applies_to(&self, hw_code: u16, stage: ExecutionStage) -> bool {
        self.hw_code == hw_code && self.target_stage == stage
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    exploit: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    hw_code: u16,
    stage: ExecutionStage,
    kind: ExploitKind,
    payload: PathBuf,
}

/// Immutable hw_code → descriptor map.
#[derive(Debug, Default, Clone)]
pub struct ExploitTable {
    by_hw_code: HashMap<u16, ExploitDescriptor>,
}

impl ExploitTable {
    pub fn new(descriptors: impl IntoIterator<Item = ExploitDescriptor>) -> Self {
        Self {
            by_hw_code: descriptors.into_iter().map(|d| (d.hw_code, d)).collect(),
        }
    }

    /// Load a manifest; payload paths are relative to its directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading exploit manifest {}", path.display()))?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("parsing exploit manifest {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));

        let mut by_hw_code = HashMap::new();
        for entry in manifest.exploit {
            let payload_path = base.join(&entry.payload);
            let payload = std::fs::read(&payload_path)
                .with_context(|| format!("reading exploit payload {}", payload_path.display()))?;
            if payload.is_empty() {
                bail!("exploit '{}' has an empty payload", entry.name);
            }
            let descriptor = ExploitDescriptor {
                name: entry.name,
                hw_code: entry.hw_code,
                target_stage: entry.stage,
                kind: entry.kind,
                payload,
            };
            if let Some(previous) = by_hw_code.insert(descriptor.hw_code, descriptor) {
                bail!(
                    "duplicate exploit for hw_code {:04X} ('{}')",
                    previous.hw_code,
                    previous.name
                );
            }
        }
        Ok(Self { by_hw_code })
    }

    pub fn get(&self, hw_code: u16) -> Option<&ExploitDescriptor> {
        self.by_hw_code.get(&hw_code)
    }

    pub fn len(&self) -> usize {
        self.by_hw_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hw_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("p.bin"), [0xDE, 0xAD]).unwrap();
        std::fs::write(
            dir.path().join("exploits.toml"),
            r#"
[[exploit]]
name = "brom-bypass"
hw_code = 0x0766
stage = "boot_rom"
kind = "bypass"
payload = "p.bin"
"#,
        )
        .unwrap();

        let table = ExploitTable::load_from_file(dir.path().join("exploits.toml")).unwrap();
        let d = table.get(0x0766).unwrap();
        assert_eq!(d.payload, vec![0xDE, 0xAD]);
        assert_eq!(d.kind.expected_ack().as_ascii(), "BYPS");
        assert!(d.applies_to(0x0766, ExecutionStage::BootRom));
        assert!(!d.applies_to(0x0766, ExecutionStage::FirstStage));
    }

    #[test]
    fn test_missing_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("exploits.toml"),
            "[[exploit]]\nname = \"x\"\nhw_code = 1\nstage = \"boot_rom\"\nkind = \"diagnostic_dump\"\npayload = \"nope.bin\"\n",
        )
        .unwrap();
        let err = ExploitTable::load_from_file(dir.path().join("exploits.toml")).unwrap_err();
        assert!(err.to_string().contains("nope.bin"));
    }
}
