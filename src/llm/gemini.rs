//! Gemini vision client.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ModelError, Result, VisionModel, VisionRequest};

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Client for the Gemini generateContent endpoint.
pub struct GeminiVision {
    api_key: String,
    model: String,
    client: Client,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Part {
    Text(String),
    InlineData { mime_type: String, data: String },
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiVision {
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

    fn classify_send_error(&self, e: reqwest::Error, timeout_secs: u64) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout {
                api: self.api_name().to_string(),
                seconds: timeout_secs,
            }
        } else {
            ModelError::Connection {
                api: self.api_name().to_string(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl VisionModel for GeminiVision {
    fn api_name(&self) -> &str {
        "gemini"
    }

    fn max_image_bytes(&self) -> usize {
        // Inline image data cap for generateContent requests.
        20 * 1024 * 1024
    }

    async fn transcribe(&self, request: &VisionRequest<'_>) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            API_BASE, self.model, self.api_key
        );
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text(request.prompt.to_string()),
                    Part::InlineData {
                        mime_type: "image/png".to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(request.image_png),
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: request.max_output_tokens,
            },
        };

        debug!(
            model = %self.model,
            image_bytes = request.image_png.len(),
            "gemini transcribe call"
        );

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e, request.timeout.as_secs()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(
                self.api_name(),
                status.as_u16(),
                message,
            ));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| ModelError::Malformed {
            api: self.api_name().to_string(),
            message: e.to_string(),
        })?;

        parsed
            .candidates
            .and_then(|mut c| c.drain(..).next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|mut p| p.drain(..).next())
            .and_then(|p| p.text)
            .ok_or_else(|| ModelError::Malformed {
                api: self.api_name().to_string(),
                message: "response carried no text part".to_string(),
            })
    }
}
