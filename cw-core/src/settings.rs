//! Settings store
//!
//! Sensors persist their display names, parameter overrides and value
//! history through this flat string store. Keys are rendered identifiers
//! with a suffix (`/intelcpu/0/temperature/1/name`).
//!
//! The on-disk form is a single JSON object in
//! ~/.config/corewatch/settings.json.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::constants::paths;
use crate::error::{CorewatchError, Result};

/// Key/value persistence used by sensors and parameters.
pub trait Settings: Send + Sync {
    fn contains(&self, key: &str) -> bool;

    fn get_value(&self, key: &str, default: &str) -> String;

    fn set_value(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

pub type SharedSettings = Arc<dyn Settings>;

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSettings {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }
}

impl Settings for MemorySettings {
    fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    fn get_value(&self, key: &str, default: &str) -> String {
        self.values
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set_value(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Settings backed by a JSON object on disk.
///
/// Reads and writes go to memory; `save()` writes the file atomically.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    inner: MemorySettings,
}

/// Default settings location, creating the directory if needed
pub fn get_settings_path() -> Result<PathBuf> {
    let dir = paths::user_config_dir()
        .ok_or_else(|| CorewatchError::config("Could not determine config directory"))?;

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| {
            CorewatchError::config(format!("Failed to create config directory: {}", e))
        })?;
    }

    Ok(dir.join(paths::SETTINGS_FILE))
}

impl JsonFileSettings {
    /// Load from `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = MemorySettings::new();

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| CorewatchError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            let map: BTreeMap<String, String> = serde_json::from_str(&content)?;
            debug!(path = %path.display(), entries = map.len(), "Loaded settings");
            *inner.values.write() = map;
        }

        Ok(Self { path, inner })
    }

    pub fn load_default() -> Result<Self> {
        Self::load(get_settings_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store to disk through a temp file and rename.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.inner.snapshot())?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| CorewatchError::FileWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let write = |p: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(p)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        write(&temp_path).map_err(|e| CorewatchError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;

        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            CorewatchError::FileWrite {
                path: self.path.clone(),
                source: e,
            }
        })?;

        debug!(path = %self.path.display(), "Saved settings");
        Ok(())
    }
}

impl Settings for JsonFileSettings {
    fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    fn get_value(&self, key: &str, default: &str) -> String {
        self.inner.get_value(key, default)
    }

    fn set_value(&self, key: &str, value: &str) {
        self.inner.set_value(key, value)
    }

    fn remove(&self, key: &str) {
        self.inner.remove(key)
    }
}

impl Drop for JsonFileSettings {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "Failed to save settings on drop");
        }
    }
}
