//! modelrack: local model runtime orchestration.
//!
//! Manages locally-hosted LLM weight files end to end: enumeration and
//! metadata merging, resource-aware context/GPU sizing, downloads with
//! progress and cancellation, the single-active-model load lifecycle, and
//! streaming generation with session repair. The tensor engine, hardware
//! introspection, conversation storage, and the remote catalog are supplied
//! by the embedder through the traits in [`engine`], [`system`],
//! [`storage`], and [`registry`].

pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod manager;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod storage;
pub mod system;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ManagerConfig;
pub use download::{format_size, DownloadProgress, Downloader, ProgressCallback};
pub use error::{ManagerError, Result};
pub use manager::{Collaborators, ModelManager};
pub use registry::{model_id, ModelRegistry, RemoteCatalog, RemoteModelEntry};
pub use resources::ResourceCalculator;
pub use runtime::{
    GenerateOptions, GenerationPipeline, GenerationResult, ModelLifecycle, NoTools,
    ResponseStream, ToolInvocation, ToolProvider,
};
pub use system::{InferenceActivity, SystemInfo, SystemInfoProvider};
pub use types::{
    ChatMessage, LoadingSettings, MessageStatus, ModelDescriptor, Role, RuntimeInfo,
    UserSettings,
};

/// Install a `tracing` subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// For binaries embedding the manager; libraries and tests should not call
/// this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
