//! Anthropic vision client.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ModelError, Result, VisionModel, VisionRequest};

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Client for the Anthropic messages endpoint.
pub struct AnthropicVision {
    api_key: String,
    model: String,
    client: Client,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Image { source: ImageSource },
    Text { text: String },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: &'static str,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicVision {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_model(api_key, DEFAULT_MODEL)
    }

    pub fn with_model(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl VisionModel for AnthropicVision {
    fn api_name(&self) -> &str {
        "anthropic"
    }

    fn max_image_bytes(&self) -> usize {
        // Per-image request cap, base64 overhead included.
        5 * 1024 * 1024
    }

    async fn transcribe(&self, request: &VisionRequest<'_>) -> Result<String> {
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_output_tokens,
            temperature: 0.0,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64",
                            media_type: "image/png",
                            data: base64::engine::general_purpose::STANDARD
                                .encode(request.image_png),
                        },
                    },
                    ContentBlock::Text {
                        text: request.prompt.to_string(),
                    },
                ],
            }],
        };

        debug!(
            model = %self.model,
            image_bytes = request.image_png.len(),
            "anthropic transcribe call"
        );

        let response = self
            .client
            .post(API_URL)
            .timeout(request.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        api: self.api_name().to_string(),
                        seconds: request.timeout.as_secs(),
                    }
                } else {
                    ModelError::Connection {
                        api: self.api_name().to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(
                self.api_name(),
                status.as_u16(),
                message,
            ));
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| ModelError::Malformed {
                api: self.api_name().to_string(),
                message: e.to_string(),
            })?;

        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| ModelError::Malformed {
                api: self.api_name().to_string(),
                message: "response carried no text block".to_string(),
            })
    }
}
