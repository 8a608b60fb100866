// OpenAI adapter over the Chat Completions API
//
// The request/response shapes here are the de-facto standard for hosted
// vision models; `ChatCompletionClient` takes the endpoint and extra headers
// as parameters so the Groq and OpenRouter adapters reuse it unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    build_prompt, classify_status, parse, retry_after_header, split_data_uri, ProviderAdapter,
    ProviderKind,
};
use crate::core::errors::{ProviderError, ProviderResult};
use crate::core::types::{ImageInput, PromptSettings, StockMetadata};

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ChatContent>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContent {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Shared Chat Completions transport for OpenAI-compatible backends.
pub(crate) struct ChatCompletionClient {
    pub model: String,
    pub endpoint: String,
    pub extra_headers: Vec<(&'static str, String)>,
    client: reqwest::Client,
}

impl ChatCompletionClient {
    pub fn new(model: String, endpoint: &str, client: reqwest::Client) -> Self {
        Self {
            model,
            endpoint: endpoint.to_string(),
            extra_headers: Vec::new(),
            client,
        }
    }

    async fn send(&self, secret: &str, body: &ChatRequest) -> ProviderResult<String> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {secret}"))
            .json(body);
        for (name, value) in &self.extra_headers {
            request = request.header(*name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(&response);
            let text = response.text().await.unwrap_or_default();
            debug!(%status, endpoint = %self.endpoint, "chat completion rejected");
            return Err(classify_status(status, retry_after, &text));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::EmptyResponse(format!("malformed response body: {e}")))?;

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProviderError::EmptyResponse("no completion choices".to_string()))
    }

    /// One user message carrying the prompt plus every image as a data URL.
    fn request(
        &self,
        images: &[ImageInput],
        settings: &PromptSettings,
    ) -> ProviderResult<ChatRequest> {
        let mut content = vec![ChatContent::Text {
            text: build_prompt(settings, images),
        }];
        for image in images {
            // Validates the payload shape; the data URL goes out verbatim.
            split_data_uri(&image.payload)?;
            content.push(ChatContent::ImageUrl {
                image_url: ImageUrl {
                    url: image.payload.clone(),
                },
            });
        }
        Ok(ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            max_tokens: 2048,
            temperature: 0.4,
        })
    }

    pub async fn validate(&self, secret: &str) -> ProviderResult<()> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: vec![ChatContent::Text {
                    text: "Reply with the single word: ok".to_string(),
                }],
            }],
            max_tokens: 8,
            temperature: 0.0,
        };
        self.send(secret, &body).await.map(|_| ())
    }

    pub async fn generate_one(
        &self,
        secret: &str,
        image: &ImageInput,
        settings: &PromptSettings,
    ) -> ProviderResult<StockMetadata> {
        let body = self.request(std::slice::from_ref(image), settings)?;
        let text = self.send(secret, &body).await?;
        parse::parse_metadata(&text, settings)
    }

    pub async fn generate_group(
        &self,
        secret: &str,
        images: &[ImageInput],
        settings: &PromptSettings,
    ) -> ProviderResult<Vec<StockMetadata>> {
        let body = self.request(images, settings)?;
        let text = self.send(secret, &body).await?;
        parse::parse_metadata_blocks(&text, images.len(), settings)
    }
}

pub struct OpenAiAdapter {
    inner: ChatCompletionClient,
}

impl OpenAiAdapter {
    pub fn new(model: String, client: reqwest::Client) -> Self {
        Self {
            inner: ChatCompletionClient::new(model, OPENAI_ENDPOINT, client),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
