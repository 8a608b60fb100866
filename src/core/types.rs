// Shared types for the metadata generation workflow

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::providers::ProviderKind;

/// Kind of media the upstream preprocessing pipeline produced the payload from.
///
/// Videos and vectors arrive here already rasterized to a single frame; the
/// kind is kept so prompts can hint at the source medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Photo,
    Video,
    Vector,
}

/// One image as delivered by the external preprocessing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInput {
    pub filename: String,
    /// Base64 data URI, e.g. `data:image/jpeg;base64,...`
    pub payload: String,
    #[serde(default)]
    pub media_kind: MediaKind,
}

/// An image bound to its position in the batch. The index is the slot the
/// final result must occupy regardless of completion order.
#[derive(Debug, Clone)]
pub struct ImageTask {
    pub index: usize,
    pub input: ImageInput,
}

/// Parsed metadata returned by a provider call, before it is bound to a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockMetadata {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
}

/// Final per-image outcome. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataResult {
    pub filename: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub failed: bool,
}

impl MetadataResult {
    pub fn from_metadata(filename: &str, meta: StockMetadata) -> Self {
        Self {
            filename: filename.to_string(),
            title: meta.title,
            description: meta.description,
            keywords: meta.keywords,
            failed: false,
        }
    }

    /// Failure placeholder after retry exhaustion or invalid input.
    /// Carries no fabricated metadata, only the filename and the flag.
    pub fn failure(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            title: String::new(),
            description: String::new(),
            keywords: Vec::new(),
            failed: true,
        }
    }
}

/// Prompt parameters forwarded to the provider adapters. Fields omitted from
/// a request body fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    /// Override of the provider's default model id.
    pub model: Option<String>,
    /// Extra instructions appended to the base prompt.
    pub custom_prompt: Option<String>,
    /// Minimum keyword count accepted from a response.
    pub min_keywords: usize,
    /// Keyword count requested from the model and cap applied when parsing.
    pub max_keywords: usize,
    /// Target platform hint (e.g. "Adobe Stock", "Shutterstock").
    pub platform: Option<String>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            model: None,
            custom_prompt: None,
            min_keywords: 10,
            max_keywords: 45,
            platform: None,
        }
    }
}

/// How the orchestrator partitions a batch into scheduling units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode", content = "size")]
pub enum SchedulingStrategy {
    /// One provider call per image, credentials rotated per task.
    #[default]
    PerImage,
    /// K images per provider call, one credential for the whole group.
    Grouped(usize),
}

/// Per-credential throughput counters surfaced to the UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialStats {
    pub processed: usize,
    pub errors: usize,
    /// Milliseconds since the batch started, at the time of last use.
    pub last_used_ms: Option<u64>,
}

/// Live view of a running (or finished) batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub current_item: Option<String>,
    pub stopped: bool,
    pub per_credential: HashMap<String, CredentialStats>,
}

/// Aggregate counters for one provider's orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider: ProviderKind,
    pub total_credentials: usize,
    pub valid_credentials: usize,
    pub total_requests: u64,
    /// Requests recorded in the current rolling minute across all credentials.
    pub requests_per_minute: u32,
}

/// Response body of `POST /generate`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped: bool,
    pub processing_time_ms: f64,
    pub results: Vec<MetadataResult>,
}

impl BatchSummary {
    pub fn new(total: usize, results: Vec<MetadataResult>, stopped: bool, elapsed_ms: f64) -> Self {
        let failed = results.iter().filter(|r| r.failed).count();
        Self {
            total,
            succeeded: results.len() - failed,
            failed,
            stopped,
            processing_time_ms: elapsed_ms,
            results,
        }
    }
}

/// Request configuration accepted by `POST /generate` alongside the images.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GenerateConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub strategy: SchedulingStrategy,
    #[serde(default)]
    pub prompt: PromptSettings,
    /// Per-request credential override (secrets supplied by the caller).
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,
}
