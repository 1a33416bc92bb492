//! Known Entity Registry
//!
//! Tagged addresses (trusted deployers, serial ruggers, exchange wallets) used
//! by scoring adjustments. Readers take a cheap `Arc` snapshot; `refresh`
//! swaps in a new version atomically. Scoring only ever sees the snapshot it
//! was handed, so results stay reproducible across a refresh.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse registry file: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to parse registry JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Registry has no source file to refresh from")]
    NoSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTag {
    TrustedDeployer,
    SerialRugger,
    Exchange,
    Scam,
    Watchlist,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityEntry {
    pub address: String,
    pub tags: Vec<EntityTag>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entity: Vec<EntityEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    entries: HashMap<String, HashSet<EntityTag>>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(version: u64, entries: Vec<EntityEntry>) -> Self {
        let mut map: HashMap<String, HashSet<EntityTag>> = HashMap::new();
        for entry in entries {
            map.entry(entry.address).or_default().extend(entry.tags);
        }
        Self {
            version,
            entries: map,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_tag(&self, address: &str, tag: EntityTag) -> bool {
        self.entries
            .get(address)
            .map_or(false, |tags| tags.contains(&tag))
    }
}

#[derive(Debug)]
pub struct KnownEntityRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    source: Option<PathBuf>,
}

impl KnownEntityRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            source: None,
        }
    }

    /// Registry backed by a TOML file of `[[entity]]` tables, loaded immediately.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let snapshot = RegistrySnapshot::from_entries(1, read_entries(&path)?);
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            source: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the registry contents, returning the new version.
    pub fn replace(&self, entries: Vec<EntityEntry>) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = guard.version + 1;
        *guard = Arc::new(RegistrySnapshot::from_entries(version, entries));
        version
    }

    /// Reload from the backing file. On error the current version stays in place.
    pub fn refresh(&self) -> Result<u64, RegistryError> {
        let path = self.source.as_ref().ok_or(RegistryError::NoSource)?;
        let entries = read_entries(path)?;
        let version = self.replace(entries);
        tracing::info!(version, path = %path.display(), "Known entity registry refreshed");
        Ok(version)
    }
}

impl Default for KnownEntityRegistry {
    fn default() -> Self {
        Self::new(RegistrySnapshot::empty())
    }
}

/// `.json` files are read as JSON, anything else as TOML. Both carry the same
/// `entity` list.
fn read_entries(path: &Path) -> Result<Vec<EntityEntry>, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let file: RegistryFile = if is_json {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };
    Ok(file.entity)
}
