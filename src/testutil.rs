//! Shared test doubles
//!
//! In-memory implementations of every collaborator contract, plus a scripted
//! engine whose sessions replay canned responses chunk by chunk.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::{
    ChatSession, ContextConfig, EngineToolCall, GpuRecommendation, HistoryEntry, InferenceEngine,
    LoadedModel, ModelContext, PromptOptions, PromptOutcome, ToolSpec, VramState,
};
use crate::error::{ManagerError, Result};
use crate::registry::{RemoteCatalog, RemoteModelEntry};
use crate::resources::{GpuTopology, ModelShape};
use crate::runtime::ToolProvider;
use crate::storage::{ConversationStore, SettingsStore};
use crate::system::{GpuDevice, SystemInfo, SystemInfoProvider};
use crate::types::{ChatMessage, UserSettings};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Write a file that passes GGUF magic validation, padded to `size` bytes
pub fn write_fake_gguf(dir: &Path, name: &str, size: usize) -> PathBuf {
    let mut content = b"GGUF".to_vec();
    content.resize(size.max(4), 0);
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Mutable hardware snapshot with an invalidation counter
pub struct MockSystem {
    info: Mutex<SystemInfo>,
    pub invalidations: AtomicU32,
}

impl MockSystem {
    pub fn with_gpu(free_vram: u64) -> Self {
        Self {
            info: Mutex::new(SystemInfo {
                cpu_threads: 16,
                free_ram_bytes: 32 * GIB,
                total_ram_bytes: 64 * GIB,
                gpu: Some(GpuDevice {
                    name: "mock-gpu".to_string(),
                    vram: VramState {
                        free: free_vram,
                        total: free_vram * 2,
                    },
                }),
            }),
            invalidations: AtomicU32::new(0),
        }
    }

    pub fn without_gpu() -> Self {
        Self {
            info: Mutex::new(SystemInfo {
                cpu_threads: 16,
                free_ram_bytes: 32 * GIB,
                total_ram_bytes: 64 * GIB,
                gpu: None,
            }),
            invalidations: AtomicU32::new(0),
        }
    }

    pub fn set_free_vram(&self, free: u64) {
        let mut info = self.info.lock().unwrap();
        if let Some(gpu) = info.gpu.as_mut() {
            gpu.vram.free = free;
        }
    }

    pub fn invalidation_count(&self) -> u32 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl SystemInfoProvider for MockSystem {
    fn system_info(&self) -> Result<SystemInfo> {
        Ok(self.info.lock().unwrap().clone())
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Settings store backed by a concurrent map, no file involved
#[derive(Default)]
pub struct MemorySettings {
    entries: DashMap<String, UserSettings>,
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn load(&self, model_id: &str) -> Option<UserSettings> {
        self.entries.get(model_id).map(|e| e.value().clone())
    }

    async fn save(&self, model_id: &str, settings: &UserSettings) -> Result<()> {
        self.entries.insert(model_id.to_string(), settings.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<HashMap<String, UserSettings>> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

/// Catalog serving a fixed entry list
#[derive(Default)]
pub struct StaticCatalog {
    entries: Vec<RemoteModelEntry>,
    token: Option<String>,
    unavailable: bool,
}

impl StaticCatalog {
    pub fn with_entries(entries: Vec<RemoteModelEntry>) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl RemoteCatalog for StaticCatalog {
    async fn list_available(&self) -> Result<Vec<RemoteModelEntry>> {
        if self.unavailable {
            return Err(ManagerError::Http("catalog offline".to_string()));
        }
        Ok(self.entries.clone())
    }

    async fn search(&self, query: &str) -> Result<Vec<RemoteModelEntry>> {
        let query = query.to_lowercase();
        Ok(self
            .list_available()
            .await?
            .into_iter()
            .filter(|e| e.name.to_lowercase().contains(&query))
            .collect())
    }

    fn credential(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Conversation store backed by a map of pre-seeded threads
#[derive(Default)]
pub struct MemoryConversations {
    threads: DashMap<String, Vec<ChatMessage>>,
}

impl MemoryConversations {
    pub fn seed_thread(&self, thread_id: &str, messages: Vec<ChatMessage>) {
        self.threads.insert(thread_id.to_string(), messages);
    }
}

#[async_trait]
impl ConversationStore for MemoryConversations {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        self.threads
            .get(thread_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ManagerError::NotFound(format!("thread '{thread_id}'")))
    }
}

/// Tool provider serving a fixed spec list
#[derive(Default)]
pub struct StaticTools {
    specs: Vec<ToolSpec>,
}

impl StaticTools {
    pub fn with_specs(specs: Vec<ToolSpec>) -> Self {
        Self { specs }
    }
}

impl ToolProvider for StaticTools {
    fn available_tools(&self) -> Vec<ToolSpec> {
        self.specs.clone()
    }
}

/// One canned prompt exchange replayed by a mock session
#[derive(Clone)]
pub struct ScriptedPrompt {
    pub chunks: Vec<String>,
    pub tool_calls: Vec<EngineToolCall>,
    pub fail: Option<ManagerError>,
    /// Pause between chunk deliveries, for cancellation tests
    pub chunk_delay: Duration,
}

impl Default for ScriptedPrompt {
    fn default() -> Self {
        Self {
            chunks: vec!["ok".to_string()],
            tool_calls: Vec::new(),
            fail: None,
            chunk_delay: Duration::ZERO,
        }
    }
}

/// Counters shared across everything a [`MockEngine`] creates
#[derive(Default)]
pub struct EngineStats {
    pub loads: AtomicU32,
    pub contexts_disposed: AtomicU32,
    pub sessions_created: AtomicU32,
    pub sessions_disposed: AtomicU32,
}

type Script = Arc<Mutex<VecDeque<ScriptedPrompt>>>;

/// Engine double: loads always succeed (after an optional delay) unless a
/// failure is armed, and sessions replay scripted exchanges in order.
pub struct MockEngine {
    pub stats: Arc<EngineStats>,
    script: Script,
    pub load_delay: Duration,
    fail_next_load: Mutex<Option<ManagerError>>,
    pub recommendation: GpuRecommendation,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(EngineStats::default()),
            script: Arc::new(Mutex::new(VecDeque::new())),
            load_delay: Duration::ZERO,
            fail_next_load: Mutex::new(None),
            recommendation: GpuRecommendation {
                gpu_layers: 35,
                batch_size: 512,
            },
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn fail_next_load(&self, err: ManagerError) {
        *self.fail_next_load.lock().unwrap() = Some(err);
    }

    pub fn push_response(&self, chunks: &[&str]) {
        self.script.lock().unwrap().push_back(ScriptedPrompt {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        });
    }

    pub fn push_slow_response(&self, chunks: &[&str], chunk_delay: Duration) {
        self.script.lock().unwrap().push_back(ScriptedPrompt {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            chunk_delay,
            ..Default::default()
        });
    }

    pub fn push_tool_response(&self, chunks: &[&str], tool_calls: Vec<EngineToolCall>) {
        self.script.lock().unwrap().push_back(ScriptedPrompt {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            tool_calls,
            ..Default::default()
        });
    }

    pub fn push_failure(&self, err: ManagerError) {
        self.script.lock().unwrap().push_back(ScriptedPrompt {
            fail: Some(err),
            ..Default::default()
        });
    }

    pub fn load_count(&self) -> u32 {
        self.stats.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn load_model(&self, _path: &Path, gpu_layers: u32) -> Result<Box<dyn LoadedModel>> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if let Some(err) = self.fail_next_load.lock().unwrap().take() {
            return Err(err);
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockModel {
            stats: self.stats.clone(),
            script: self.script.clone(),
            gpu_layers,
        }))
    }

    fn gpu_type(&self) -> Option<String> {
        Some("mock".to_string())
    }

    fn recommend_gpu_settings(
        &self,
        _topology: &GpuTopology,
        _shape: &ModelShape,
    ) -> Result<GpuRecommendation> {
        Ok(self.recommendation)
    }
}

pub struct MockModel {
    stats: Arc<EngineStats>,
    script: Script,
    gpu_layers: u32,
}

#[async_trait]
impl LoadedModel for MockModel {
    async fn create_context(
        &self,
        context_size: u32,
        batch_size: u32,
        threads: u32,
    ) -> Result<Box<dyn ModelContext>> {
        Ok(Box::new(MockContext {
            stats: self.stats.clone(),
            script: self.script.clone(),
            config: ContextConfig {
                context_size,
                batch_size,
                threads,
            },
        }))
    }

    fn actual_gpu_layers(&self) -> u32 {
        self.gpu_layers
    }
}

pub struct MockContext {
    stats: Arc<EngineStats>,
    script: Script,
    config: ContextConfig,
}

#[async_trait]
impl ModelContext for MockContext {
    fn create_session(&self) -> Result<Box<dyn ChatSession>> {
        self.stats.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            stats: self.stats.clone(),
            script: self.script.clone(),
            history: Vec::new(),
        }))
    }

    fn config(&self) -> ContextConfig {
        self.config
    }

    async fn dispose(&self) {
        self.stats.contexts_disposed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockSession {
    stats: Arc<EngineStats>,
    script: Script,
    history: Vec<HistoryEntry>,
}

#[async_trait]
impl ChatSession for MockSession {
    async fn prompt(&mut self, text: &str, options: PromptOptions) -> Result<PromptOutcome> {
        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        if let Some(err) = scripted.fail {
            return Err(err);
        }

        if let Some(sink) = &options.chunk_sink {
            for chunk in &scripted.chunks {
                if !scripted.chunk_delay.is_zero() {
                    tokio::time::sleep(scripted.chunk_delay).await;
                }
                if sink.send(chunk.clone()).await.is_err() {
                    break;
                }
            }
        }

        let text_out = scripted.chunks.concat();
        self.history.push(HistoryEntry::User(text.to_string()));
        self.history
            .push(HistoryEntry::Assistant(vec![text_out.clone()]));
        Ok(PromptOutcome {
            text: text_out,
            tool_calls: scripted.tool_calls,
        })
    }

    fn chat_history(&self) -> Vec<HistoryEntry> {
        self.history.clone()
    }

    fn set_chat_history(&mut self, history: Vec<HistoryEntry>) {
        self.history = history;
    }

    fn dispose(&mut self) {
        self.stats.sessions_disposed.fetch_add(1, Ordering::SeqCst);
    }
}
