//! Durable flags for the preview origin
//!
//! Stored in ~/.local/share/mmd-previewer/storage.json (or the configured
//! state directory), one flag set per origin. Flags are only ever added.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Set the first time the interception process becomes active
pub const READINESS_KEY: &str = "mmdPreviewer-workerReady";

const STORAGE_FILE: &str = "storage.json";

/// One recorded flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFlag {
    pub set_at: DateTime<Utc>,
}

type Flags = BTreeMap<String, StoredFlag>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageFile {
    #[serde(default)]
    origins: BTreeMap<String, Flags>,
}

/// JSON-backed flag store for one origin.
///
/// Several origins may share a state directory; each only sees its own flags.
#[derive(Debug, Clone)]
pub struct ReadinessStore {
    path: PathBuf,
    origin: String,
}

impl ReadinessStore {
    /// Get the default state directory (~/.local/share/mmd-previewer)
    pub fn default_dir() -> Result<PathBuf> {
        let dir = dirs::data_dir()
            .context("Could not determine data directory")?
            .join("mmd-previewer");
        Ok(dir)
    }

    /// Flags for `origin` (e.g. `http://127.0.0.1:8080`), kept in `dir`
    pub fn at(dir: &Path, origin: &str) -> Self {
        Self {
            path: dir.join(STORAGE_FILE),
            origin: origin.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<StoredFlag>> {
        Ok(self
            .load()?
            .origins
            .remove(&self.origin)
            .and_then(|mut flags| flags.remove(key)))
    }

    pub fn is_set(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Record a flag; an existing flag keeps its original timestamp
    pub fn set(&self, key: &str) -> Result<()> {
        let mut file = self.load()?;
        let flags = file.origins.entry(self.origin.clone()).or_default();
        if flags.contains_key(key) {
            return Ok(());
        }
        flags.insert(
            key.to_string(),
            StoredFlag {
                set_at: Utc::now(),
            },
        );
        self.save(&file)?;
        debug!("Recorded flag {} for {} in {:?}", key, self.origin, self.path);
        Ok(())
    }

    fn load(&self) -> Result<StorageFile> {
        if !self.path.exists() {
            return Ok(StorageFile::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;

        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", self.path))
    }

    fn save(&self, file: &StorageFile) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let content = serde_json::to_string_pretty(file).context("Failed to serialize storage")?;

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {:?}", self.path))?;

        Ok(())
    }
}
