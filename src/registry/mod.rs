//! Model registry
//!
//! Enumerates local weight files, assigns stable path-hash identifiers, and
//! merges metadata from the remote catalog, GGUF-embedded fields, and
//! filename heuristics into fully-populated descriptors. The effective
//! context length is recomputed against current VRAM on every enumeration
//! and persisted back into the model's settings.

pub mod metadata;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::download::Downloader;
use crate::error::{ManagerError, Result};
use crate::resources::ResourceCalculator;
use crate::storage::SettingsStore;
use crate::system::SystemInfoProvider;
use crate::types::{LoadingSettings, ModelDescriptor, UserSettings};
use metadata::GgufMetadataSource;

const DEFAULT_CONTEXT: u32 = 4096;
const DEFAULT_BATCH: u32 = 512;

/// One downloadable model as reported by the remote catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteModelEntry {
    pub name: String,
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub parameter_count: Option<f64>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub max_context_length: Option<u32>,
    #[serde(default)]
    pub layer_count: Option<u32>,
}

/// Remote model catalog and gated-download credentials
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn list_available(&self) -> Result<Vec<RemoteModelEntry>>;

    async fn search(&self, query: &str) -> Result<Vec<RemoteModelEntry>>;

    /// Bearer token for gated repositories, when the user configured one
    fn credential(&self) -> Option<String>;
}

/// Stable model identifier: hex SHA-256 of the absolute file path
pub fn model_id(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Local model enumeration and metadata merging
pub struct ModelRegistry {
    models_dir: PathBuf,
    catalog: Arc<dyn RemoteCatalog>,
    gguf: Arc<dyn GgufMetadataSource>,
    settings: Arc<dyn SettingsStore>,
    calculator: Arc<ResourceCalculator>,
    system: Arc<dyn SystemInfoProvider>,
}

impl ModelRegistry {
    pub fn new(
        models_dir: PathBuf,
        catalog: Arc<dyn RemoteCatalog>,
        gguf: Arc<dyn GgufMetadataSource>,
        settings: Arc<dyn SettingsStore>,
        calculator: Arc<ResourceCalculator>,
        system: Arc<dyn SystemInfoProvider>,
    ) -> Self {
        Self {
            models_dir,
            catalog,
            gguf,
            settings,
            calculator,
            system,
        }
    }

    /// Enumerate local weight files as fully-populated descriptors.
    ///
    /// Descriptors are recomputed on every call, never cached: the
    /// downloading flag, the settings snapshot, and the VRAM-dependent
    /// context length all change underneath us.
    pub async fn list_local(&self, downloader: &Downloader) -> Result<Vec<ModelDescriptor>> {
        let pattern = self.models_dir.join("*.gguf");
        let paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| ManagerError::Io(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        // Remote metadata is an enrichment, not a requirement: local models
        // must stay usable offline.
        let remote = match self.catalog.list_available().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("remote catalog unavailable: {}", e);
                Vec::new()
            }
        };

        let mut descriptors = Vec::with_capacity(paths.len());
        for path in paths {
            descriptors.push(self.build_descriptor(&path, &remote, downloader).await?);
        }

        // In-flight downloads write to `<filename>.part`, so the glob never
        // sees them; surface them as not-yet-downloaded entries.
        for filename in downloader.active_downloads() {
            if descriptors.iter().any(|d| d.filename == filename) {
                continue;
            }
            descriptors.push(self.pending_descriptor(&filename, &remote, downloader));
        }

        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    /// Resolve a model by id first, then by display name or filename.
    ///
    /// Only resolves completed files; an entry that is still downloading has
    /// no weights to load, configure, or delete yet.
    pub async fn resolve(
        &self,
        id_or_name: &str,
        downloader: &Downloader,
    ) -> Result<ModelDescriptor> {
        let mut descriptors = self.list_local(downloader).await?;
        descriptors.retain(|d| d.downloaded);
        descriptors
            .iter()
            .find(|d| d.id == id_or_name)
            .or_else(|| {
                descriptors
                    .iter()
                    .find(|d| d.name.eq_ignore_ascii_case(id_or_name) || d.filename == id_or_name)
            })
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("model '{id_or_name}'")))
    }

    /// Remove a local weight file. The caller unloads the model first if it
    /// is active.
    pub async fn delete(&self, id: &str, downloader: &Downloader) -> Result<()> {
        let descriptor = self.resolve(id, downloader).await?;
        tokio::fs::remove_file(&descriptor.path).await?;
        tracing::info!(model = %descriptor.name, "deleted local model file");
        Ok(())
    }

    /// Descriptor for a download still in flight. No file exists yet, so
    /// sizing is skipped and metadata comes from the catalog or the filename.
    fn pending_descriptor(
        &self,
        filename: &str,
        remote: &[RemoteModelEntry],
        downloader: &Downloader,
    ) -> ModelDescriptor {
        let path = self.models_dir.join(filename);
        let entry = remote.iter().find(|e| e.filename == filename);
        let size_bytes = entry
            .map(|e| e.size_bytes)
            .or_else(|| downloader.progress(filename).map(|p| p.total_bytes))
            .unwrap_or(0);

        ModelDescriptor {
            id: model_id(&path),
            name: entry
                .map(|e| e.name.clone())
                .unwrap_or_else(|| metadata::display_name(filename)),
            filename: filename.to_string(),
            path,
            size_bytes,
            downloaded: false,
            downloading: true,
            context_length: None,
            max_context_length: entry
                .and_then(|e| e.max_context_length)
                .or_else(|| metadata::context_length_from_filename(filename)),
            layer_count: entry.and_then(|e| e.layer_count),
            parameter_count: entry
                .and_then(|e| e.parameter_count)
                .or_else(|| metadata::parameter_count_from_filename(filename)),
            quantization: entry
                .and_then(|e| e.quantization.clone())
                .or_else(|| metadata::quantization_from_filename(filename)),
            settings: LoadingSettings::default(),
        }
    }

    async fn build_descriptor(
        &self,
        path: &Path,
        remote: &[RemoteModelEntry],
        downloader: &Downloader,
    ) -> Result<ModelDescriptor> {
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let id = model_id(&absolute);
        let filename = absolute
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let size_bytes = std::fs::metadata(&absolute).map(|m| m.len()).unwrap_or(0);

        let embedded = self.gguf.metadata(&absolute);
        let catalog_entry = remote.iter().find(|e| e.filename == filename);

        // Precedence: remote catalog > file-embedded > filename heuristics
        let layer_count = catalog_entry
            .and_then(|e| e.layer_count)
            .or_else(|| embedded.as_ref().and_then(metadata::embedded_layer_count));
        let max_context_length = catalog_entry
            .and_then(|e| e.max_context_length)
            .or_else(|| embedded.as_ref().and_then(metadata::embedded_context_length))
            .or_else(|| metadata::context_length_from_filename(&filename));
        let parameter_count = catalog_entry
            .and_then(|e| e.parameter_count)
            .or_else(|| metadata::parameter_count_from_filename(&filename));
        let quantization = catalog_entry
            .and_then(|e| e.quantization.clone())
            .or_else(|| metadata::quantization_from_filename(&filename));
        let name = catalog_entry
            .map(|e| e.name.clone())
            .unwrap_or_else(|| metadata::display_name(&filename));

        let user = self.settings.load(&id).await.unwrap_or_default();
        let requested_context = user
            .context_size
            .or(max_context_length)
            .unwrap_or(DEFAULT_CONTEXT);
        let effective_context = self.calculator.safe_context_size(
            size_bytes,
            requested_context,
            &filename,
            layer_count,
            user.batch_size.unwrap_or(DEFAULT_BATCH),
            self.system.as_ref(),
        )?;

        // Persist the VRAM-consistent value so later loads pick it up even
        // if the user never set a context size explicitly.
        if user.context_size != Some(effective_context) {
            let mut updated = user.clone();
            updated.context_size = Some(effective_context);
            self.settings.save(&id, &updated).await?;
        }

        let settings = user.merged_with(&LoadingSettings {
            context_size: effective_context,
            ..Default::default()
        });

        Ok(ModelDescriptor {
            id,
            name,
            filename: filename.clone(),
            path: absolute,
            size_bytes,
            downloaded: true,
            downloading: downloader.is_downloading(&filename),
            context_length: Some(effective_context),
            max_context_length,
            layer_count,
            parameter_count,
            quantization,
            settings,
        })
    }
}
