//! Model lifecycle
//!
//! One model is active at a time. Loading resolves the descriptor, sizes the
//! GPU offload and batch against current hardware, loads weights, creates a
//! context and a session, and replaces whatever occupied the slot before.
//! Concurrent load requests for the same model collapse into a single engine
//! load; every waiter receives the one real outcome.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::download::Downloader;
use crate::engine::{ChatSession, InferenceEngine, LoadedModel, ModelContext};
use crate::error::{ManagerError, Result};
use crate::registry::ModelRegistry;
use crate::resources::ResourceCalculator;
use crate::storage::SettingsStore;
use crate::system::SystemInfoProvider;
use crate::types::{LoadingSettings, ModelDescriptor, RuntimeInfo};

/// Engine threads are capped regardless of core count; past this the
/// scheduler overhead outweighs the parallelism.
const MAX_ENGINE_THREADS: u32 = 8;

/// Engine thread count for a host with `cpu_threads` logical cores: one core
/// is left for the rest of the process, capped at [`MAX_ENGINE_THREADS`].
pub(crate) fn engine_thread_count(cpu_threads: u32) -> u32 {
    cpu_threads.saturating_sub(1).clamp(1, MAX_ENGINE_THREADS)
}

type LoadOutcome = Option<std::result::Result<(), ManagerError>>;

/// Everything tied to the currently loaded model.
///
/// Dropped as a unit on unload; the context is disposed explicitly first so
/// native resources are released before the slot is vacated.
pub(crate) struct ActiveModel {
    pub(crate) descriptor: ModelDescriptor,
    pub(crate) runtime: RuntimeInfo,
    pub(crate) model: Box<dyn LoadedModel>,
    pub(crate) context: Box<dyn ModelContext>,
    pub(crate) session: Box<dyn ChatSession>,
    /// Conversation thread whose history the session currently mirrors
    pub(crate) hydrated_thread: Option<String>,
}

/// Load/unload state machine around the single active-model slot
pub struct ModelLifecycle {
    engine: Arc<dyn InferenceEngine>,
    registry: Arc<ModelRegistry>,
    downloader: Arc<Downloader>,
    settings: Arc<dyn SettingsStore>,
    calculator: Arc<ResourceCalculator>,
    system: Arc<dyn SystemInfoProvider>,
    active: Mutex<Option<ActiveModel>>,
    in_flight: DashMap<String, watch::Receiver<LoadOutcome>>,
}

impl ModelLifecycle {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        registry: Arc<ModelRegistry>,
        downloader: Arc<Downloader>,
        settings: Arc<dyn SettingsStore>,
        calculator: Arc<ResourceCalculator>,
        system: Arc<dyn SystemInfoProvider>,
    ) -> Self {
        Self {
            engine,
            registry,
            downloader,
            settings,
            calculator,
            system,
            active: Mutex::new(None),
            in_flight: DashMap::new(),
        }
    }

    /// Load a model by id, name, or filename.
    ///
    /// Idempotent for the already-active model. When another load for the
    /// same model is in flight the call waits for it instead of starting a
    /// second engine load.
    pub async fn load_model(&self, id_or_name: &str) -> Result<RuntimeInfo> {
        let descriptor = self.registry.resolve(id_or_name, &self.downloader).await?;

        {
            let active = self.active.lock().await;
            if let Some(current) = active.as_ref() {
                if current.descriptor.id == descriptor.id {
                    return Ok(current.runtime.clone());
                }
            }
        }

        let (tx, rx) = watch::channel::<LoadOutcome>(None);
        let leader = match self.in_flight.entry(descriptor.id.clone()) {
            Entry::Occupied(existing) => {
                let rx = existing.get().clone();
                drop(existing);
                self.wait_for_load(&descriptor.id, rx).await?;
                let active = self.active.lock().await;
                return active
                    .as_ref()
                    .filter(|a| a.descriptor.id == descriptor.id)
                    .map(|a| a.runtime.clone())
                    .ok_or_else(|| {
                        ManagerError::Engine("model unloaded before load settled".to_string())
                    });
            }
            Entry::Vacant(slot) => {
                slot.insert(rx);
                tx
            }
        };

        let result = self.perform_load(&descriptor).await;
        self.in_flight.remove(&descriptor.id);
        let _ = leader.send(Some(result.clone().map(|_| ())));
        result
    }

    async fn wait_for_load(
        &self,
        model_id: &str,
        mut rx: watch::Receiver<LoadOutcome>,
    ) -> Result<()> {
        tracing::debug!(model_id, "joining in-flight load");
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            rx.changed()
                .await
                .map_err(|_| ManagerError::Engine("load task dropped".to_string()))?;
        }
    }

    async fn perform_load(&self, descriptor: &ModelDescriptor) -> Result<RuntimeInfo> {
        let started = Instant::now();
        tracing::info!(model = %descriptor.name, "loading model");

        // Vacate the slot before the new load so its VRAM is available
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.dispose(previous).await;
        }

        // Fresh hardware numbers; stale VRAM here means a bad layer count
        self.system.invalidate();
        let info = self
            .system
            .system_info()
            .map_err(|e| ManagerError::ResourceUnavailable(e.to_string()))?;

        let recommendation = self.calculator.optimal_gpu_and_batch(
            descriptor.size_bytes,
            descriptor.layer_count,
            descriptor.settings.context_size,
            &info,
            self.engine.as_ref(),
        );
        let computed = LoadingSettings {
            gpu_layers: recommendation.gpu_layers,
            context_size: descriptor.settings.context_size,
            batch_size: recommendation.batch_size,
            threads: engine_thread_count(info.cpu_threads),
            ..Default::default()
        };
        let user = self.settings.load(&descriptor.id).await.unwrap_or_default();
        let effective = user.merged_with(&computed);

        tracing::debug!(
            gpu_layers = effective.gpu_layers,
            context_size = effective.context_size,
            batch_size = effective.batch_size,
            threads = effective.threads,
            "resolved loading settings"
        );

        let model = self
            .engine
            .load_model(&descriptor.path, effective.gpu_layers)
            .await?;
        let context = model
            .create_context(
                effective.context_size,
                effective.batch_size,
                effective.threads,
            )
            .await?;
        let session = context.create_session()?;

        let runtime = RuntimeInfo {
            actual_gpu_layers: model.actual_gpu_layers(),
            gpu_type: self.engine.gpu_type(),
            loading_time_ms: started.elapsed().as_millis() as u64,
        };

        *active = Some(ActiveModel {
            descriptor: descriptor.clone(),
            runtime: runtime.clone(),
            model,
            context,
            session,
            hydrated_thread: None,
        });

        // The load itself consumed VRAM; cached sizing answers are stale now
        self.system.invalidate();
        self.calculator.clear_cache();

        tracing::info!(
            model = %descriptor.name,
            gpu_layers = runtime.actual_gpu_layers,
            elapsed_ms = runtime.loading_time_ms,
            "model loaded"
        );
        Ok(runtime)
    }

    /// Unload a specific model; returns whether it was the active one
    pub async fn unload_model(&self, id_or_name: &str) -> Result<bool> {
        let mut active = self.active.lock().await;
        let matches = active.as_ref().is_some_and(|a| {
            a.descriptor.id == id_or_name
                || a.descriptor.name.eq_ignore_ascii_case(id_or_name)
                || a.descriptor.filename == id_or_name
        });
        if !matches {
            return Ok(false);
        }
        if let Some(previous) = active.take() {
            self.dispose(previous).await;
        }
        Ok(true)
    }

    /// Unload whatever is active, if anything
    pub async fn unload_all(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.dispose(previous).await;
        }
    }

    async fn dispose(&self, mut previous: ActiveModel) {
        previous.session.dispose();
        previous.context.dispose().await;
        self.system.invalidate();
        self.calculator.clear_cache();
        tracing::info!(model = %previous.descriptor.name, "model unloaded");
    }

    pub async fn is_loaded(&self, id_or_name: &str) -> bool {
        let active = self.active.lock().await;
        active.as_ref().is_some_and(|a| {
            a.descriptor.id == id_or_name
                || a.descriptor.name.eq_ignore_ascii_case(id_or_name)
                || a.descriptor.filename == id_or_name
        })
    }

    /// Descriptor of the active model, if one is loaded
    pub async fn active_descriptor(&self) -> Option<ModelDescriptor> {
        self.active.lock().await.as_ref().map(|a| a.descriptor.clone())
    }

    /// Post-load facts for the active model, if one is loaded
    pub async fn active_runtime(&self) -> Option<RuntimeInfo> {
        self.active.lock().await.as_ref().map(|a| a.runtime.clone())
    }

    /// Exclusive access to the active-model slot for the generation pipeline
    pub(crate) async fn active_slot(&self) -> MutexGuard<'_, Option<ActiveModel>> {
        self.active.lock().await
    }

    pub(crate) fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }
}
