//! Loader repository: where agent images come from.
//!
//! [`DirectoryRepository`] reads `loaders.toml` from a directory:
//!
//! ```toml
//! [[loader]]
//! hw_code = 0x0766
//! first = "0766/stage1.bin"
//! first_address = 0x200000
//! second = "0766/agent.bin"
//! second_address = 0x40000000
//! digest = "0766/digest.bin"
//! signature = "0766/sig.bin"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::agent::{AgentBundle, AgentImage, AgentStage};
use crate::auth::AuthMaterial;
use crate::chip::ChipIdentity;
use crate::error::{FlashError, Result};

pub trait LoaderRepository: Send + Sync {
    /// Agent images (and optional credential) for an identified chip.
    fn fetch(&self, chip: &ChipIdentity) -> Result<AgentBundle>;
}

#[derive(Debug, Clone, Deserialize)]
struct LoaderEntry {
    hw_code: u16,
    first: PathBuf,
    first_address: u64,
    second: Option<PathBuf>,
    second_address: Option<u64>,
    digest: Option<PathBuf>,
    signature: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LoaderIndex {
    #[serde(default)]
    loader: Vec<LoaderEntry>,
}

pub const INDEX_FILE: &str = "loaders.toml";

#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
    entries: Vec<LoaderEntry>,
}

impl DirectoryRepository {
    pub fn open<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let index_path = root.join(INDEX_FILE);
        let content = std::fs::read_to_string(&index_path)?;
        let index: LoaderIndex = toml::from_str(&content)?;
        info!(root = %root.display(), loaders = index.loader.len(), "Loader repository opened");
        Ok(Self {
            root,
            entries: index.loader,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn read(&self, relative: &Path) -> Result<Vec<u8>> {
        let path = self.root.join(relative);
        debug!(path = %path.display(), "Reading loader file");
        std::fs::read(&path).map_err(|e| {
            FlashError::Config(format!("cannot read loader file {}: {e}", path.display()))
        })
    }
}

impl LoaderRepository for DirectoryRepository {
    fn fetch(&self, chip: &ChipIdentity) -> Result<AgentBundle> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.hw_code == chip.hw_code)
            .ok_or_else(|| {
                FlashError::Config(format!("no loader for hw_code {:04X}", chip.hw_code))
            })?;

        let first = AgentImage {
            data: self.read(&entry.first)?,
            address: entry.first_address,
            stage: AgentStage::First,
        };
        let second = match (&entry.second, entry.second_address) {
            (Some(path), Some(address)) => Some(AgentImage {
                data: self.read(path)?,
                address,
                stage: AgentStage::Second,
            }),
            (None, None) => None,
            _ => {
                return Err(FlashError::Config(format!(
                    "loader {:04X}: second image and address must be given together",
                    entry.hw_code
                )));
            }
        };
        let auth = match (&entry.digest, &entry.signature) {
            (Some(d), Some(s)) => Some(AuthMaterial::DigestSignature {
                digest: self.read(d)?,
                signature: self.read(s)?,
            }),
            _ => None,
        };
        Ok(AgentBundle {
            first,
            second,
            auth,
        })
    }
}
