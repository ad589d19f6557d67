//! Filename and file-embedded metadata heuristics
//!
//! Weight files encode a surprising amount of metadata in their names
//! (`Meta-Llama-3-8B-Instruct.Q4_K_M.gguf`). These helpers extract parameter
//! count, quantization, and context length from filenames, and probe the
//! architecture namespaces of GGUF-embedded metadata supplied by the external
//! header parser.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

/// Metadata namespaces probed for layer/context fields, most common first
const ARCHITECTURES: &[&str] = &[
    "llama", "qwen2", "qwen3", "gemma", "gemma2", "phi3", "mistral", "granite", "falcon",
];

/// File extensions recognized as model weights
const WEIGHT_EXTENSIONS: &[&str] = &["gguf", "bin"];

static PARAM_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.?\d*)[bB](?:[-_.]|$)").unwrap());

static CONTEXT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:^|[-_.])(\d+)k(?:[-_.]|$)").unwrap());

/// Quantization labels in match-priority order: the more specific patterns
/// must win over their prefixes (Q4_K_M before Q4_K before Q4).
static QUANT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)iq1_[sm]", "IQ1_S"),
        (r"(?i)iq2_(xxs|xs|s|m)", "IQ2_XS"),
        (r"(?i)iq3_(xxs|xs|s|m)", "IQ3_XS"),
        (r"(?i)iq4_(nl|xs)", "IQ4_NL"),
        (r"(?i)q2_k_s", "Q2_K_S"),
        (r"(?i)q3_k_s", "Q3_K_S"),
        (r"(?i)q3_k_m", "Q3_K_M"),
        (r"(?i)q3_k_l", "Q3_K_L"),
        (r"(?i)q4_k_s", "Q4_K_S"),
        (r"(?i)q4_k_m", "Q4_K_M"),
        (r"(?i)q5_k_s", "Q5_K_S"),
        (r"(?i)q5_k_m", "Q5_K_M"),
        (r"(?i)q6_k", "Q6_K"),
        (r"(?i)q2_k", "Q2_K"),
        (r"(?i)q3_k", "Q3_K"),
        (r"(?i)q4_k", "Q4_K"),
        (r"(?i)q5_k", "Q5_K"),
        (r"(?i)q4_0", "Q4_0"),
        (r"(?i)q4_1", "Q4_1"),
        (r"(?i)q5_0", "Q5_0"),
        (r"(?i)q5_1", "Q5_1"),
        (r"(?i)q8_0", "Q8_0"),
        (r"(?i)bf16", "BF16"),
        (r"(?i)fp?16", "F16"),
        (r"(?i)fp?32", "F32"),
    ]
    .iter()
    .map(|(pattern, label)| (Regex::new(pattern).unwrap(), *label))
    .collect()
});

/// Parameter count in billions from a filename (`7B`, `8x7B`, `1.5b`)
pub fn parameter_count_from_filename(filename: &str) -> Option<f64> {
    PARAM_COUNT_RE
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|count| *count > 0.0)
}

/// Quantization label from a filename. Falls back to `F16` for recognized
/// weight extensions where nothing matches, since unquantized GGUF exports
/// default to 16-bit.
pub fn quantization_from_filename(filename: &str) -> Option<String> {
    for (pattern, label) in QUANT_PATTERNS.iter() {
        if pattern.is_match(filename) {
            return Some((*label).to_string());
        }
    }
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())?;
    WEIGHT_EXTENSIONS
        .contains(&extension.as_str())
        .then(|| "F16".to_string())
}

/// Context length from a `32k`-style filename token, in tokens
pub fn context_length_from_filename(filename: &str) -> Option<u32> {
    CONTEXT_RE
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|k| k * 1024)
}

/// Display name: filename without extension or quantization suffix,
/// separators normalized to spaces
pub fn display_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let mut name = stem.to_string();
    for (pattern, _) in QUANT_PATTERNS.iter() {
        if let Some(m) = pattern.find(&name) {
            name.truncate(m.start());
            break;
        }
    }
    name.trim_end_matches(['-', '_', '.'])
        .replace(['-', '_'], " ")
        .trim()
        .to_string()
}

/// Layer count from GGUF-embedded metadata, probing each known
/// architecture's `block_count` key
pub fn embedded_layer_count(metadata: &HashMap<String, serde_json::Value>) -> Option<u32> {
    probe_architectures(metadata, "block_count")
}

/// Training context length from GGUF-embedded metadata
pub fn embedded_context_length(metadata: &HashMap<String, serde_json::Value>) -> Option<u32> {
    probe_architectures(metadata, "context_length")
}

fn probe_architectures(
    metadata: &HashMap<String, serde_json::Value>,
    field: &str,
) -> Option<u32> {
    ARCHITECTURES.iter().find_map(|arch| {
        metadata
            .get(&format!("{arch}.{field}"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    })
}

/// Source of pre-parsed GGUF header metadata (the parsing itself happens in
/// an external collaborator).
pub trait GgufMetadataSource: Send + Sync {
    /// Raw metadata key/value map for a weight file, if readable
    fn metadata(&self, path: &Path) -> Option<HashMap<String, serde_json::Value>>;
}

/// A source that never has metadata, for setups without a header parser
pub struct NoGgufMetadata;

impl GgufMetadataSource for NoGgufMetadata {
    fn metadata(&self, _path: &Path) -> Option<HashMap<String, serde_json::Value>> {
        None
    }
}
