// Gemini adapter: generateContent with inline image parts
//
// Gemini takes multiple inline_data parts in one request, so grouped
// scheduling maps to a single call with one labelled block per image.

use async_trait::async_trait;
use tracing::debug;

use super::{
    build_prompt, classify_status, parse, retry_after_header, split_data_uri, ProviderAdapter,
    ProviderKind,
};
use crate::core::errors::{ProviderError, ProviderResult};
use crate::core::types::{ImageInput, PromptSettings, StockMetadata};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiAdapter {
    model: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(model: String, client: reqwest::Client) -> Self {
        Self { model, client }
    }

    async fn call(&self, secret: &str, body: serde_json::Value) -> ProviderResult<String> {
        let url = format!("{API_BASE}/{}:generateContent?key={}", self.model, secret);

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let text = response.text().await.unwrap_or_default();
            debug!(%status, "Gemini request rejected");
            return Err(classify_status(status, retry_after, &text));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::EmptyResponse(format!("malformed response body: {e}")))?;

        payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::EmptyResponse("no text candidate in response".to_string())
            })
    }

    fn request_body(
        &self,
        images: &[ImageInput],
        settings: &PromptSettings,
    ) -> ProviderResult<serde_json::Value> {
        let mut parts = vec![serde_json::json!({ "text": build_prompt(settings, images) })];
        for image in images {
            let (mime, data) = split_data_uri(&image.payload)?;
            parts.push(serde_json::json!({
                "inline_data": {
                    "mime_type": mime,
                    "data": data,
                }
            }));
        }
        Ok(serde_json::json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "temperature": 0.4,
                "maxOutputTokens": 2048,
            }
        }))
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn validate(&self, secret: &str) -> ProviderResult<()> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": "Reply with the single word: ok" }] }],
            "generationConfig": { "maxOutputTokens": 8 }
        });
        self.call(secret, body).await.map(|_| ())
    }

    async fn generate_one(
        &self,
        secret: &str,
        image: &ImageInput,
        settings: &PromptSettings,
    ) -> ProviderResult<StockMetadata> {
        let body = self.request_body(std::slice::from_ref(image), settings)?;
        let text = self.call(secret, body).await?;
        parse::parse_metadata(&text, settings)
    }

    async fn generate_group(
        &self,
        secret: &str,
        images: &[ImageInput],
        settings: &PromptSettings,
    ) -> ProviderResult<Vec<StockMetadata>> {
        let body = self.request_body(images, settings)?;
        let text = self.call(secret, body).await?;
        parse::parse_metadata_blocks(&text, images.len(), settings)
    }
}
