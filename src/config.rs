//! Runtime directories
//!
//! Data lives under the platform data directory (weights in a `models/`
//! subdirectory, settings beside it) unless the embedder supplies a root.

use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ManagerError, Result};

/// Filesystem layout for one manager instance
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Settings and other small state
    pub data_dir: PathBuf,
    /// Local weight files
    pub models_dir: PathBuf,
}

impl ManagerConfig {
    /// Platform-default layout (e.g. `~/.local/share/modelrack` on Linux)
    pub fn from_project_dirs() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "modelrack").ok_or_else(|| {
            ManagerError::Io("could not determine a platform data directory".to_string())
        })?;
        let data_dir = dirs.data_dir().to_path_buf();
        Ok(Self {
            models_dir: data_dir.join("models"),
            data_dir,
        })
    }

    /// Everything under one root; used by tests and embedders with their own
    /// directory conventions.
    pub fn with_root(root: &Path) -> Self {
        Self {
            data_dir: root.to_path_buf(),
            models_dir: root.join("models"),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }
}
