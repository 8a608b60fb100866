// OpenRouter adapter: OpenAI-compatible gateway to many upstream models
//
// OpenRouter asks clients to identify themselves via HTTP-Referer and
// X-Title; requests without them get deprioritized on free tiers.

use async_trait::async_trait;

use super::openai::ChatCompletionClient;
use super::{ProviderAdapter, ProviderKind};
use crate::core::errors::ProviderResult;
use crate::core::types::{ImageInput, PromptSettings, StockMetadata};

const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterAdapter {
    inner: ChatCompletionClient,
}

impl OpenRouterAdapter {
    pub fn new(model: String, client: reqwest::Client) -> Self {
        let mut inner = ChatCompletionClient::new(model, OPENROUTER_ENDPOINT, client);
        inner.extra_headers = vec![
            ("HTTP-Referer", "https://github.com/stockmeta".to_string()),
            ("X-Title", "stockmeta".to_string()),
        ];
        Self { inner }
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
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

    async fn generate_group(
        &self,
        secret: &str,
        images: &[ImageInput],
        settings: &PromptSettings,
    ) -> ProviderResult<Vec<StockMetadata>> {
        self.inner.generate_group(secret, images, settings).await
    }
}
