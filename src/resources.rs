//! Resource calculator
//!
//! Pure sizing logic: how much context fits in free VRAM for a given model,
//! and which GPU-layer/batch configuration to use. The memory model is a
//! deliberate overestimate dominated by the KV cache; it must stay monotone
//! in the context length so the binary search below is well defined.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::engine::{GpuRecommendation, InferenceEngine};
use crate::error::{ManagerError, Result};
use crate::system::{SystemInfo, SystemInfoProvider};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Smallest context worth creating; also the binary-search floor
pub const MIN_CONTEXT: u32 = 512;

/// Share of free VRAM a context is allowed to consume
const VRAM_BUDGET_FRACTION: f64 = 0.8;

/// Cached context-size results stay valid this long
const CONTEXT_CACHE_TTL: Duration = Duration::from_secs(300);

/// RAM kept free for the rest of the system on the CPU path
const SYSTEM_RESERVE_BYTES: u64 = GIB;

/// Approximate per-token working memory on the CPU path
const CPU_TOKEN_COST_BYTES: u64 = 512 * 1024;

const MIN_BATCH: u32 = 32;
const MAX_CPU_BATCH: u32 = 512;
const DEFAULT_BATCH: u32 = 512;

/// Normalized hardware topology handed to the engine's configuration routine
#[derive(Debug, Clone)]
pub struct GpuTopology {
    pub cpu_threads: u32,
    pub vram_free: u64,
    pub vram_total: u64,
    pub gpu_name: Option<String>,
}

impl GpuTopology {
    pub fn from_system_info(info: &SystemInfo) -> Self {
        Self {
            cpu_threads: info.cpu_threads,
            vram_free: info.gpu.as_ref().map(|g| g.vram.free).unwrap_or(0),
            vram_total: info.gpu.as_ref().map(|g| g.vram.total).unwrap_or(0),
            gpu_name: info.gpu.as_ref().map(|g| g.name.clone()),
        }
    }
}

/// Transformer shape used for memory estimates.
///
/// Exact values come from file metadata when available; otherwise the shape
/// is estimated from the file size using typical GQA configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub hidden_size: u64,
    pub heads: u64,
    pub kv_heads: u64,
    pub layers: u64,
}

impl ModelShape {
    pub fn estimate(size_bytes: u64, layer_count: Option<u32>) -> Self {
        let size_gb = size_bytes as f64 / GIB as f64;
        let layers = layer_count
            .map(u64::from)
            .unwrap_or_else(|| ((size_gb * 8.0).floor() as u64).clamp(32, 80));
        let (hidden_size, heads, kv_heads) = if size_gb < 1.5 {
            (2048, 16, 4)
        } else if size_gb < 6.0 {
            (4096, 32, 8)
        } else if size_gb < 12.0 {
            (5120, 40, 10)
        } else {
            (8192, 64, 16)
        };
        Self {
            hidden_size,
            heads,
            kv_heads,
            layers,
        }
    }
}

/// Estimated memory footprint of a context of `context` tokens.
///
/// Sum of the 16-bit KV cache, a per-batch input buffer, and the compute
/// scratch buffer. Non-decreasing in `context`.
pub fn context_memory_bytes(shape: &ModelShape, context: u32, batch_size: u32) -> u64 {
    let kv_dim = shape.hidden_size * shape.kv_heads / shape.heads;
    let kv_cache = 2 * kv_dim * shape.layers * context as u64 * 2;
    let input_buffer = context as u64 * 4 + batch_size as u64 * shape.hidden_size * 4;
    let compute_buffer =
        (((context as f64 / 1024.0) * 2.0 + 0.75) * shape.heads as f64 * MIB as f64) as u64;
    kv_cache + input_buffer + compute_buffer
}

struct CachedContext {
    context_size: u32,
    computed_at: Instant,
}

/// Context-size and GPU/batch sizing with a short-lived result cache.
///
/// The cache is keyed by `(filename, model size, requested context)`: two
/// callers requesting different context sizes for the same model never share
/// an entry, since different requests have different feasibility.
pub struct ResourceCalculator {
    context_cache: DashMap<(String, u64, u32), CachedContext>,
}

impl Default for ResourceCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCalculator {
    pub fn new() -> Self {
        Self {
            context_cache: DashMap::new(),
        }
    }

    /// Drop all cached context-size results
    pub fn clear_cache(&self) {
        self.context_cache.clear();
    }

    /// Largest context size, at most `requested`, whose estimated footprint
    /// fits in 80% of currently-free VRAM.
    ///
    /// Returns `requested` unchanged when no GPU is present (the caller then
    /// chooses a CPU path). Fails with [`ManagerError::ResourceUnavailable`]
    /// when the VRAM state cannot be read: substituting a guess here could
    /// cause an out-of-memory load.
    pub fn safe_context_size(
        &self,
        model_size_bytes: u64,
        requested: u32,
        filename: &str,
        layer_count: Option<u32>,
        batch_size: u32,
        system: &dyn SystemInfoProvider,
    ) -> Result<u32> {
        let requested = requested.max(MIN_CONTEXT);
        let key = (filename.to_string(), model_size_bytes, requested);

        if let Some(cached) = self.context_cache.get(&key) {
            if cached.computed_at.elapsed() < CONTEXT_CACHE_TTL {
                return Ok(cached.context_size);
            }
        }
        self.context_cache.remove(&key);

        let info = system
            .system_info()
            .map_err(|e| ManagerError::ResourceUnavailable(e.to_string()))?;
        let Some(gpu) = info.gpu else {
            return Ok(requested);
        };

        let budget = (gpu.vram.free as f64 * VRAM_BUDGET_FRACTION) as u64;
        let shape = ModelShape::estimate(model_size_bytes, layer_count);
        let fits = |context: u32| context_memory_bytes(&shape, context, batch_size) <= budget;

        let result = if fits(requested) {
            requested
        } else {
            // Largest fitting context in [512, requested]; the footprint is
            // monotone in context so the search is unambiguous.
            let mut lo = MIN_CONTEXT;
            let mut hi = requested;
            while lo < hi {
                let mid = lo + (hi - lo).div_ceil(2);
                if fits(mid) {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            // The search bottoms out at the floor even when nothing fits;
            // returning an infeasible size would OOM the load.
            if !fits(lo) {
                return Err(ManagerError::ResourceUnavailable(format!(
                    "{filename}: a {MIN_CONTEXT}-token context does not fit the VRAM budget ({} bytes free)",
                    gpu.vram.free
                )));
            }
            tracing::debug!(
                filename,
                requested,
                result = lo,
                free_vram = gpu.vram.free,
                "context size reduced to fit VRAM budget"
            );
            lo
        };

        self.context_cache.insert(
            key,
            CachedContext {
                context_size: result,
                computed_at: Instant::now(),
            },
        );
        Ok(result)
    }

    /// GPU-layer count and batch size for a model at a given context size.
    ///
    /// Delegates to the engine's configuration routine; a zero-layer answer
    /// or missing GPU falls back to a CPU batch computed from RAM headroom,
    /// and a routine failure falls back to static size tiers with zero GPU
    /// layers.
    pub fn optimal_gpu_and_batch(
        &self,
        model_size_bytes: u64,
        layer_count: Option<u32>,
        context_size: u32,
        info: &SystemInfo,
        engine: &dyn InferenceEngine,
    ) -> GpuRecommendation {
        let shape = ModelShape::estimate(model_size_bytes, layer_count);
        let topology = GpuTopology::from_system_info(info);

        match engine.recommend_gpu_settings(&topology, &shape) {
            Ok(rec) if info.gpu.is_some() && rec.gpu_layers > 0 => rec,
            Ok(_) => GpuRecommendation {
                gpu_layers: 0,
                batch_size: cpu_batch_size(model_size_bytes, context_size, &shape, info),
            },
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "gpu configuration routine failed, using static fallback tiers"
                );
                GpuRecommendation {
                    gpu_layers: 0,
                    batch_size: fallback_batch_size(model_size_bytes, context_size),
                }
            }
        }
    }
}

/// CPU-only batch size from available RAM headroom: free RAM minus the model
/// and context footprint, plus a quarter of free VRAM when a GPU exists,
/// minus a 1 GiB system reserve, divided by the per-token cost.
fn cpu_batch_size(
    model_size_bytes: u64,
    context_size: u32,
    shape: &ModelShape,
    info: &SystemInfo,
) -> u32 {
    let context_mem = context_memory_bytes(shape, context_size, DEFAULT_BATCH);
    let vram_share = info.gpu.as_ref().map(|g| g.vram.free / 4).unwrap_or(0);
    let headroom = (info.free_ram_bytes + vram_share)
        .saturating_sub(model_size_bytes + context_mem + SYSTEM_RESERVE_BYTES);
    ((headroom / CPU_TOKEN_COST_BYTES) as u32).clamp(MIN_BATCH, MAX_CPU_BATCH)
}

/// Static batch tiers keyed by model size in MB, used only when the
/// configuration routine itself fails. Large contexts take the smaller batch
/// of each tier.
fn fallback_batch_size(model_size_bytes: u64, context_size: u32) -> u32 {
    let size_mb = model_size_bytes / MIB;
    let (small, large) = if size_mb > 15000 {
        (1024, 2048)
    } else if size_mb > 8000 {
        (2048, 4096)
    } else if size_mb > 4000 {
        (4096, 8192)
    } else {
        (8192, 16384)
    };
    if context_size > 8192 {
        small
    } else {
        large
    }
}
