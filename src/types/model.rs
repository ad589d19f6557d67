//! Model types
//!
//! Defines model metadata and loading configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for one local weight file, merged from the remote catalog,
/// file-embedded metadata, and filename heuristics.
///
/// Recomputed on every registry enumeration and immutable once returned;
/// the `id` is a content hash of the absolute file path, so it stays stable
/// across restarts as long as the file does not move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable identifier (hex SHA-256 of the absolute path)
    pub id: String,
    /// Display name derived from the filename or the remote catalog
    pub name: String,
    /// File name on disk (e.g. `llama-3-8b.Q4_K_M.gguf`)
    pub filename: String,
    /// Absolute path to the weight file
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// Whether the file is present locally
    pub downloaded: bool,
    /// Whether a download for this filename is currently in flight
    pub downloading: bool,
    /// Effective context length (VRAM-consistent, recomputed per enumeration)
    pub context_length: Option<u32>,
    /// Training context length reported by file metadata or the catalog
    pub max_context_length: Option<u32>,
    /// Transformer layer count, when known
    pub layer_count: Option<u32>,
    /// Parameter count in billions, when known
    pub parameter_count: Option<f64>,
    /// Quantization label (e.g. `Q4_K_M`, `F16`)
    pub quantization: Option<String>,
    /// Effective loading settings snapshot for this model
    pub settings: LoadingSettings,
}

/// Fully-populated loading configuration handed to the native engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingSettings {
    /// GPU layer count actually passed to the engine
    pub gpu_layers: u32,
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub temperature: f32,
}

impl Default for LoadingSettings {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            context_size: 4096,
            batch_size: 512,
            threads: 4,
            temperature: 0.7,
        }
    }
}

/// User-set loading preferences for one model id.
///
/// Every field is optional: an absent field means "use the computed default".
/// `gpu_layers` additionally honors a `-1` sentinel meaning "compute it for
/// me", which is treated exactly like an absent value rather than passed
/// through to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl UserSettings {
    /// Merge user preferences over computed defaults.
    pub fn merged_with(&self, computed: &LoadingSettings) -> LoadingSettings {
        let gpu_layers = match self.gpu_layers {
            Some(n) if n >= 0 => n as u32,
            // -1 sentinel or absent: recompute
            _ => computed.gpu_layers,
        };
        LoadingSettings {
            gpu_layers,
            context_size: self.context_size.unwrap_or(computed.context_size),
            batch_size: self.batch_size.unwrap_or(computed.batch_size),
            threads: self.threads.unwrap_or(computed.threads),
            temperature: self.temperature.unwrap_or(computed.temperature),
        }
    }
}

/// Facts observed after a model finished loading.
///
/// Created when the load settles and discarded on unload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Layer count the engine actually offloaded to the GPU
    pub actual_gpu_layers: u32,
    /// GPU type reported by the engine, if any
    pub gpu_type: Option<String>,
    /// Wall-clock load duration in milliseconds
    pub loading_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_settings_take_precedence() {
        let user = UserSettings {
            gpu_layers: Some(20),
            context_size: Some(8192),
            ..Default::default()
        };
        let computed = LoadingSettings {
            gpu_layers: 35,
            context_size: 4096,
            ..Default::default()
        };
        let effective = user.merged_with(&computed);
        assert_eq!(effective.gpu_layers, 20);
        assert_eq!(effective.context_size, 8192);
        assert_eq!(effective.batch_size, computed.batch_size);
    }

    #[test]
    fn test_gpu_layer_auto_sentinel_uses_computed_value() {
        let user = UserSettings {
            gpu_layers: Some(-1),
            context_size: Some(8192),
            ..Default::default()
        };
        let computed = LoadingSettings {
            gpu_layers: 35,
            ..Default::default()
        };
        let effective = user.merged_with(&computed);
        assert_eq!(effective.gpu_layers, 35);
        assert_eq!(effective.context_size, 8192);
    }

    #[test]
    fn test_absent_fields_fall_back_to_computed() {
        let user = UserSettings::default();
        let computed = LoadingSettings {
            gpu_layers: 12,
            context_size: 2048,
            batch_size: 256,
            threads: 8,
            temperature: 0.2,
        };
        assert_eq!(user.merged_with(&computed), computed);
    }

    #[test]
    fn test_user_settings_serialization_skips_absent_fields() {
        let user = UserSettings {
            context_size: Some(16384),
            ..Default::default()
        };
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, r#"{"context_size":16384}"#);
        let back: UserSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user);
    }
}
