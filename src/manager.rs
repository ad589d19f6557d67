//! Manager facade
//!
//! Single entry point wiring the registry, downloader, lifecycle, and
//! generation pipeline together. Embedders construct one of these with their
//! engine and storage implementations and keep it for the process lifetime.

use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::download::{DownloadProgress, Downloader, ProgressCallback};
use crate::engine::InferenceEngine;
use crate::error::{ManagerError, Result};
use crate::registry::metadata::GgufMetadataSource;
use crate::registry::{ModelRegistry, RemoteCatalog, RemoteModelEntry};
use crate::resources::ResourceCalculator;
use crate::runtime::lifecycle::engine_thread_count;
use crate::runtime::{
    GenerateOptions, GenerationPipeline, GenerationResult, ModelLifecycle, ResponseStream,
    ToolProvider,
};
use crate::storage::{ConversationStore, JsonSettingsStore, SettingsStore};
use crate::system::{InferenceActivity, SystemInfoProvider};
use crate::types::{ChatMessage, LoadingSettings, ModelDescriptor, RuntimeInfo, UserSettings};

/// External collaborators the manager is built around
pub struct Collaborators {
    pub engine: Arc<dyn InferenceEngine>,
    pub system: Arc<dyn SystemInfoProvider>,
    pub catalog: Arc<dyn RemoteCatalog>,
    pub gguf: Arc<dyn GgufMetadataSource>,
    pub conversations: Arc<dyn ConversationStore>,
    pub tools: Arc<dyn ToolProvider>,
}

/// The model manager: registry, downloads, lifecycle, and generation behind
/// one surface.
pub struct ModelManager {
    registry: Arc<ModelRegistry>,
    downloader: Arc<Downloader>,
    lifecycle: Arc<ModelLifecycle>,
    pipeline: GenerationPipeline,
    settings: Arc<dyn SettingsStore>,
    catalog: Arc<dyn RemoteCatalog>,
    calculator: Arc<ResourceCalculator>,
    system: Arc<dyn SystemInfoProvider>,
    activity: InferenceActivity,
}

impl ModelManager {
    pub fn new(config: ManagerConfig, collaborators: Collaborators) -> Result<Self> {
        config.ensure_dirs()?;

        let settings: Arc<dyn SettingsStore> =
            Arc::new(JsonSettingsStore::open(&config.data_dir)?);
        let calculator = Arc::new(ResourceCalculator::new());
        let downloader = Arc::new(Downloader::new(config.models_dir.clone())?);
        let registry = Arc::new(ModelRegistry::new(
            config.models_dir.clone(),
            collaborators.catalog.clone(),
            collaborators.gguf,
            settings.clone(),
            calculator.clone(),
            collaborators.system.clone(),
        ));
        let lifecycle = Arc::new(ModelLifecycle::new(
            collaborators.engine,
            registry.clone(),
            downloader.clone(),
            settings.clone(),
            calculator.clone(),
            collaborators.system.clone(),
        ));
        let activity = InferenceActivity::new();
        let pipeline = GenerationPipeline::new(
            lifecycle.clone(),
            collaborators.conversations,
            collaborators.tools,
            activity.clone(),
        );

        Ok(Self {
            registry,
            downloader,
            lifecycle,
            pipeline,
            settings,
            catalog: collaborators.catalog,
            calculator,
            system: collaborators.system,
            activity,
        })
    }

    /// Shared "inference running" flag, for system-info providers that defer
    /// hardware polling during generation.
    pub fn activity(&self) -> InferenceActivity {
        self.activity.clone()
    }

    // -- registry ----------------------------------------------------------

    /// All local models with merged metadata and current sizing
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.registry.list_local(&self.downloader).await
    }

    pub async fn list_remote(&self) -> Result<Vec<RemoteModelEntry>> {
        self.catalog.list_available().await
    }

    pub async fn search_remote(&self, query: &str) -> Result<Vec<RemoteModelEntry>> {
        self.catalog.search(query).await
    }

    /// Delete a local model file, unloading it first when it is active
    pub async fn delete_model(&self, id_or_name: &str) -> Result<()> {
        if self.lifecycle.is_loaded(id_or_name).await {
            self.lifecycle.unload_model(id_or_name).await?;
        }
        self.registry.delete(id_or_name, &self.downloader).await
    }

    // -- downloads ---------------------------------------------------------

    /// Download a catalog model by filename or display name
    pub async fn download_model(
        &self,
        filename_or_name: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<std::path::PathBuf> {
        let entries = self.catalog.list_available().await?;
        let entry = entries
            .iter()
            .find(|e| e.filename == filename_or_name)
            .or_else(|| {
                entries
                    .iter()
                    .find(|e| e.name.eq_ignore_ascii_case(filename_or_name))
            })
            .ok_or_else(|| {
                ManagerError::NotFound(format!("remote model '{filename_or_name}'"))
            })?;

        let credential = self.catalog.credential();
        self.downloader
            .download(entry, credential.as_deref(), on_progress)
            .await
    }

    pub fn cancel_download(&self, filename: &str) -> bool {
        self.downloader.cancel_download(filename)
    }

    pub fn download_progress(&self, filename: &str) -> Option<DownloadProgress> {
        self.downloader.progress(filename)
    }

    pub fn is_downloading(&self, filename: &str) -> bool {
        self.downloader.is_downloading(filename)
    }

    // -- lifecycle ---------------------------------------------------------

    pub async fn load_model(&self, id_or_name: &str) -> Result<RuntimeInfo> {
        self.lifecycle.load_model(id_or_name).await
    }

    /// Load a model and hydrate its session from a stored thread in one call
    pub async fn load_model_with_history(
        &self,
        id_or_name: &str,
        thread_id: &str,
    ) -> Result<RuntimeInfo> {
        let runtime = self.lifecycle.load_model(id_or_name).await?;
        self.pipeline
            .update_session_history(id_or_name, thread_id)
            .await?;
        Ok(runtime)
    }

    pub async fn unload_model(&self, id_or_name: &str) -> Result<bool> {
        self.lifecycle.unload_model(id_or_name).await
    }

    pub async fn unload_all(&self) {
        self.lifecycle.unload_all().await
    }

    /// Descriptor of the active model, if any
    pub async fn loaded_model(&self) -> Option<ModelDescriptor> {
        self.lifecycle.active_descriptor().await
    }

    /// Post-load facts for the active model, if any
    pub async fn runtime_info(&self) -> Option<RuntimeInfo> {
        self.lifecycle.active_runtime().await
    }

    /// Whether the given model is the currently active one
    pub async fn is_loaded(&self, id_or_name: &str) -> bool {
        self.lifecycle.is_loaded(id_or_name).await
    }

    /// Refresh the active session's history from a stored thread, replaying
    /// the thread even if the session already mirrors it.
    pub async fn update_session_history(&self, id_or_name: &str, thread_id: &str) -> Result<()> {
        self.pipeline.update_session_history(id_or_name, thread_id).await
    }

    // -- settings ----------------------------------------------------------

    /// Raw user overrides for a model, if any were saved
    pub async fn model_settings(&self, id_or_name: &str) -> Result<Option<UserSettings>> {
        let descriptor = self.registry.resolve(id_or_name, &self.downloader).await?;
        Ok(self.settings.load(&descriptor.id).await)
    }

    /// Save user overrides. Takes effect on the next load; cached sizing
    /// results are dropped so the new values are honored immediately.
    pub async fn update_settings(
        &self,
        id_or_name: &str,
        settings: &UserSettings,
    ) -> Result<()> {
        let descriptor = self.registry.resolve(id_or_name, &self.downloader).await?;
        self.settings.save(&descriptor.id, settings).await?;
        self.calculator.clear_cache();
        Ok(())
    }

    /// Drop all user overrides for a model and return the settings the
    /// manager would compute for it right now.
    pub async fn optimal_settings(&self, id_or_name: &str) -> Result<LoadingSettings> {
        let descriptor = self.registry.resolve(id_or_name, &self.downloader).await?;
        self.settings
            .save(&descriptor.id, &UserSettings::default())
            .await?;
        self.calculator.clear_cache();

        // Re-resolve so the context length is recomputed without overrides
        let descriptor = self.registry.resolve(&descriptor.id, &self.downloader).await?;
        let info = self
            .system
            .system_info()
            .map_err(|e| ManagerError::ResourceUnavailable(e.to_string()))?;
        let recommendation = self.calculator.optimal_gpu_and_batch(
            descriptor.size_bytes,
            descriptor.layer_count,
            descriptor.settings.context_size,
            &info,
            self.lifecycle_engine(),
        );

        Ok(LoadingSettings {
            gpu_layers: recommendation.gpu_layers,
            context_size: descriptor.settings.context_size,
            batch_size: recommendation.batch_size,
            // Same formula a load applies, so the reported and effective
            // configurations agree
            threads: engine_thread_count(info.cpu_threads),
            ..Default::default()
        })
    }

    // -- generation --------------------------------------------------------

    /// Run the latest user message in `messages` against a model, loading it
    /// first if necessary, and return the full response.
    pub async fn generate_response(
        &self,
        id_or_name: &str,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        self.pipeline
            .generate_response(id_or_name, messages, options)
            .await
    }

    /// Like [`generate_response`](Self::generate_response), but chunks are
    /// pulled from the returned stream as the engine produces them.
    pub fn generate_stream_response(
        &self,
        id_or_name: &str,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> ResponseStream {
        self.pipeline
            .generate_stream_response(id_or_name, messages, options)
    }

    pub fn is_generating(&self) -> bool {
        self.pipeline.is_generating()
    }

    fn lifecycle_engine(&self) -> &dyn InferenceEngine {
        self.lifecycle.engine()
    }
}
