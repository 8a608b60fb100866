// Groq adapter: OpenAI-compatible Chat Completions endpoint

use async_trait::async_trait;

use super::openai::ChatCompletionClient;
use super::{ProviderAdapter, ProviderKind};
use crate::core::errors::ProviderResult;
use crate::core::types::{ImageInput, PromptSettings, StockMetadata};

const GROQ_ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";

pub struct GroqAdapter {
    inner: ChatCompletionClient,
}

impl GroqAdapter {
    pub fn new(model: String, client: reqwest::Client) -> Self {
        Self {
            inner: ChatCompletionClient::new(model, GROQ_ENDPOINT, client),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GroqAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Groq
    }

    fn model(&self) -> &str {
        &self.inner.model
    }

    async fn validate(&self, secret: &str) -> ProviderResult<()> {
        self.inner.validate(secret).await
    }

    async fn generate_one(
        &self,
        secret: &str,
        image: &ImageInput,
        settings: &PromptSettings,
    ) -> ProviderResult<StockMetadata> {
        self.inner.generate_one(secret, image, settings).await
    }

    // Groq vision models accept a single image per request, so grouped
    // scheduling falls back to the default one-call-per-image loop.
}
