//! System introspection contract
//!
//! Hardware facts (CPU threads, RAM, GPU/VRAM) come from an external
//! provider. The orchestrator only consumes snapshots and invalidates them
//! whenever a load or unload changes free VRAM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::VramState;
use crate::error::Result;

/// Hardware snapshot used for sizing decisions
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub cpu_threads: u32,
    pub free_ram_bytes: u64,
    pub total_ram_bytes: u64,
    /// `None` means no usable GPU; sizing then takes the CPU path
    pub gpu: Option<GpuDevice>,
}

/// A detected GPU and its memory state
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub name: String,
    pub vram: VramState,
}

/// Provider of (cached) hardware snapshots.
///
/// Implementations should consult [`InferenceActivity`] and defer expensive
/// hardware queries while generation is running: polling the GPU mid-forward
/// pass reports skewed VRAM readings.
pub trait SystemInfoProvider: Send + Sync {
    /// Current hardware snapshot. Fails when VRAM/RAM state cannot be read;
    /// the orchestrator propagates that instead of guessing.
    fn system_info(&self) -> Result<SystemInfo>;

    /// Drop any cached snapshot so the next query re-reads the hardware
    fn invalidate(&self);
}

/// Process-wide "inference in progress" flag.
///
/// Injected into both the generation pipeline and the system-info provider
/// so the dependency stays visible and testable. Global per process, not per
/// model: only one model is ever active.
#[derive(Clone, Debug, Default)]
pub struct InferenceActivity {
    active: Arc<AtomicBool>,
}

impl InferenceActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark generation as running until the returned guard drops
    pub fn begin(&self) -> ActivityGuard {
        self.active.store(true, Ordering::SeqCst);
        ActivityGuard {
            active: self.active.clone(),
        }
    }
}

/// Clears the activity flag on drop, so the flag cannot leak past a failed
/// or cancelled generation.
pub struct ActivityGuard {
    active: Arc<AtomicBool>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
