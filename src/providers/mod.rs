// Provider adapters: a uniform {validate, generate} capability per backend
//
// Adapters are pure functions of (credential secret, payload) -> result.
// They never touch the credential pool or the rate limiter; scheduling and
// accounting belong to the orchestrator.

pub mod gemini;
pub mod groq;
pub mod openai;
pub mod openrouter;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Config;
use crate::core::errors::{ProviderError, ProviderResult};
use crate::core::types::{ImageInput, MediaKind, PromptSettings, StockMetadata};
use crate::middleware::{RateLimitPolicy, RateLimiter};

/// Supported generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    OpenAi,
    Groq,
    OpenRouter,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Gemini,
        ProviderKind::OpenAi,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    /// Fixed rate policy for this provider. Constants, not user-configurable.
    pub fn rate_limiter(&self, has_purchased_credits: bool) -> RateLimiter {
        match self {
            ProviderKind::Gemini => RateLimiter::new(RateLimitPolicy::fixed(12)),
            ProviderKind::OpenAi => RateLimiter::new(RateLimitPolicy::fixed(60)),
            ProviderKind::Groq => RateLimiter::new(RateLimitPolicy::fixed(30)),
            ProviderKind::OpenRouter => {
                // Paid models: conservative flat per-minute ceiling. Free
                // models (":free" suffix): the same ceiling plus a daily cap
                // that depends on whether the account has purchased credits.
                // Both keep a 2-slot safety buffer and a 3s per-credential gap.
                let base = RateLimitPolicy {
                    requests_per_minute: 20,
                    daily_quota: None,
                    min_gap: Some(Duration::from_secs(3)),
                    safety_buffer: 2,
                    window: Duration::from_secs(60),
                    day: Duration::from_secs(24 * 60 * 60),
                };
                let free = RateLimitPolicy {
                    daily_quota: Some(if has_purchased_credits { 1000 } else { 50 }),
                    ..base.clone()
                };
                RateLimiter::tiered(base, free)
            }
        }
    }

    pub fn default_model(&self, config: &Config) -> String {
        match self {
            ProviderKind::Gemini => config.providers.gemini_model.clone(),
            ProviderKind::OpenAi => config.providers.openai_model.clone(),
            ProviderKind::Groq => config.providers.groq_model.clone(),
            ProviderKind::OpenRouter => config.providers.openrouter_model.clone(),
        }
    }

    pub fn seed_keys(&self, config: &Config) -> Vec<String> {
        match self {
            ProviderKind::Gemini => config.providers.gemini_keys.clone(),
            ProviderKind::OpenAi => config.providers.openai_keys.clone(),
            ProviderKind::Groq => config.providers.groq_keys.clone(),
            ProviderKind::OpenRouter => config.providers.openrouter_keys.clone(),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Uniform capability every backend implements.
///
/// Uses `async_trait` because we hand out `Arc<dyn ProviderAdapter>` for
/// dynamic dispatch across backends (and mock adapters in tests).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Model id this adapter sends requests to.
    fn model(&self) -> &str;

    /// One minimal real request to confirm the credential is usable.
    /// `Err(ProviderError::Auth)` means definitively invalid; any other error
    /// is a blip and must not discard the key.
    async fn validate(&self, secret: &str) -> ProviderResult<()>;

    /// Generate metadata for one image.
    async fn generate_one(
        &self,
        secret: &str,
        image: &ImageInput,
        settings: &PromptSettings,
    ) -> ProviderResult<StockMetadata>;

    /// Generate metadata for a group of images in a single call, where the
    /// backend supports multi-image prompts. Default: one call per image.
    async fn generate_group(
        &self,
        secret: &str,
        images: &[ImageInput],
        settings: &PromptSettings,
    ) -> ProviderResult<Vec<StockMetadata>> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            out.push(self.generate_one(secret, image, settings).await?);
        }
        Ok(out)
    }
}

/// Build the adapter for a provider. The shared reqwest client carries the
/// connection pool; per-call deadlines are enforced by the orchestrator.
pub fn make_adapter(
    kind: ProviderKind,
    model: String,
    client: reqwest::Client,
) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Gemini => Arc::new(gemini::GeminiAdapter::new(model, client)),
        ProviderKind::OpenAi => Arc::new(openai::OpenAiAdapter::new(model, client)),
        ProviderKind::Groq => Arc::new(groq::GroqAdapter::new(model, client)),
        ProviderKind::OpenRouter => Arc::new(openrouter::OpenRouterAdapter::new(model, client)),
    }
}

/// Payloads smaller than this cannot be a real image.
const MIN_PAYLOAD_BYTES: usize = 64;

/// Split a `data:<mime>;base64,<data>` URI into mime type and base64 body.
pub(crate) fn split_data_uri(payload: &str) -> ProviderResult<(&str, &str)> {
    let rest = payload
        .strip_prefix("data:")
        .ok_or_else(|| ProviderError::InvalidInput("payload is not a data URI".to_string()))?;
    let (mime, data) = rest
        .split_once(";base64,")
        .ok_or_else(|| ProviderError::InvalidInput("payload is not base64-encoded".to_string()))?;
    if data.len() < MIN_PAYLOAD_BYTES {
        return Err(ProviderError::InvalidInput(format!(
            "payload too small ({} bytes of base64)",
            data.len()
        )));
    }
    if !mime.starts_with("image/") {
        return Err(ProviderError::InvalidInput(format!(
            "unsupported media type: {mime}"
        )));
    }
    Ok((mime, data))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    // Truncate on a char boundary; error bodies are arbitrary text.
    match trimmed.char_indices().nth(200) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Map an HTTP error status to a typed provider error. Shared by all
/// adapters so the orchestrator sees one taxonomy.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    retry_after_secs: Option<u64>,
    body: &str,
) -> ProviderError {
    let code = status.as_u16();
    match code {
        401 | 403 => ProviderError::Auth(snippet(body)),
        429 => ProviderError::RateLimited { retry_after_secs },
        402 => ProviderError::RateLimited { retry_after_secs: None },
        400 => ProviderError::InvalidInput(snippet(body)),
        500..=599 => ProviderError::Overloaded(format!("{code}: {}", snippet(body))),
        _ if body.to_lowercase().contains("quota") => {
            ProviderError::RateLimited { retry_after_secs }
        }
        _ => ProviderError::Overloaded(format!("{code}: {}", snippet(body))),
    }
}

pub(crate) fn retry_after_header(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn media_hint(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "photograph",
        MediaKind::Video => "video still frame",
        MediaKind::Vector => "vector illustration",
    }
}

/// Base prompt shared by all adapters: labelled lines the parser can bind
/// deterministically.
pub(crate) fn build_prompt(settings: &PromptSettings, images: &[ImageInput]) -> String {
    let mut prompt = String::new();
    let platform = settings.platform.as_deref().unwrap_or("stock photography platforms");

    if images.len() == 1 {
        prompt.push_str(&format!(
            "You are writing metadata for a {} to be sold on {platform}.\n",
            media_hint(images[0].media_kind)
        ));
        prompt.push_str("Respond with exactly three labelled lines:\n");
    } else {
        prompt.push_str(&format!(
            "You are writing metadata for {} images to be sold on {platform}.\n\
             For EACH image, in order, respond with a block of exactly three labelled lines, \
             separating blocks with a line containing only `---`:\n",
            images.len()
        ));
    }

    prompt.push_str(&format!(
        "Title: a concrete, specific title of 50-70 characters (no placeholders, no brackets)\n\
         Description: one factual sentence of 100-200 characters describing the content\n\
         Keywords: {} to {} comma-separated single keywords, most relevant first\n",
        settings.min_keywords.max(10),
        settings.max_keywords
    ));

    if let Some(extra) = settings.custom_prompt.as_deref() {
        prompt.push('\n');
        prompt.push_str(extra);
        prompt.push('\n');
    }

    prompt
}
