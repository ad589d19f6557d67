//! Per-model settings storage
//!
//! User loading preferences keyed by model id, persisted as one JSON blob
//! and cached in memory for the process lifetime.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::UserSettings;

const SETTINGS_FILE: &str = "model-settings.json";

/// Load/save access to per-model user settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// User settings for one model id, if any were ever saved
    async fn load(&self, model_id: &str) -> Option<UserSettings>;

    /// Persist settings for one model id
    async fn save(&self, model_id: &str, settings: &UserSettings) -> Result<()>;

    /// All persisted settings, keyed by model id
    async fn load_all(&self) -> Result<HashMap<String, UserSettings>>;
}

/// JSON-file settings store with an in-memory cache.
///
/// The cache is filled once at open and kept authoritative afterwards; every
/// save rewrites the whole file (the blob stays small, one entry per model).
pub struct JsonSettingsStore {
    path: PathBuf,
    cache: DashMap<String, UserSettings>,
}

impl JsonSettingsStore {
    /// Open the store under the given data directory, reading any existing
    /// settings file. A corrupted file is logged and replaced on next save.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        let cache = DashMap::new();

        if path.exists() {
            let json = fs::read_to_string(&path)?;
            match serde_json::from_str::<HashMap<String, UserSettings>>(&json) {
                Ok(map) => {
                    for (id, settings) in map {
                        cache.insert(id, settings);
                    }
                    tracing::debug!(entries = cache.len(), "loaded model settings");
                }
                Err(e) => {
                    tracing::warn!("model settings file corrupted, starting fresh: {}", e);
                }
            }
        }

        Ok(Self { path, cache })
    }

    fn persist(&self) -> Result<()> {
        let snapshot: HashMap<String, UserSettings> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.path, json)?;
        tracing::debug!("saved model settings");
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load(&self, model_id: &str) -> Option<UserSettings> {
        self.cache.get(model_id).map(|entry| entry.value().clone())
    }

    async fn save(&self, model_id: &str, settings: &UserSettings) -> Result<()> {
        self.cache.insert(model_id.to_string(), settings.clone());
        self.persist()
    }

    async fn load_all(&self) -> Result<HashMap<String, UserSettings>> {
        Ok(self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}
