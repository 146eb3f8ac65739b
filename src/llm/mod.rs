//! Vision model clients for the OCR pipeline.
//!
//! The pipeline only depends on the [`VisionModel`] capability contract;
//! concrete clients for the Gemini and Anthropic APIs live here. Errors
//! carry the transient/permanent split the retry logic keys on.

mod anthropic;
mod gemini;
pub mod prompts;

pub use anthropic::AnthropicVision;
pub use gemini::GeminiVision;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{api}: rate limited")]
    RateLimited { api: String },
    #[error("{api}: unavailable: {message}")]
    Unavailable { api: String, message: String },
    #[error("{api}: timed out after {seconds}s")]
    Timeout { api: String, seconds: u64 },
    #[error("{api}: connection failed: {message}")]
    Connection { api: String, message: String },
    #[error("{api}: API error (HTTP {status}): {message}")]
    Api {
        api: String,
        status: u16,
        message: String,
    },
    #[error("{api}: malformed response: {message}")]
    Malformed { api: String, message: String },
    #[error("{api}: invalid credentials")]
    Auth { api: String },
}

impl ModelError {
    /// Transient errors are retried by the parallel-map retry logic;
    /// permanent ones propagate to the job level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Unavailable { .. }
                | Self::Timeout { .. }
                | Self::Connection { .. }
        )
    }

    /// Classify an HTTP status into the taxonomy.
    pub fn from_status(api: &str, status: u16, message: String) -> Self {
        match status {
            429 => Self::RateLimited {
                api: api.to_string(),
            },
            401 | 403 => Self::Auth {
                api: api.to_string(),
            },
            500..=599 => Self::Unavailable {
                api: api.to_string(),
                message,
            },
            _ => Self::Api {
                api: api.to_string(),
                status,
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// One vision call: a prompt plus a single PNG page image.
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub prompt: &'a str,
    pub image_png: &'a [u8],
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

/// Capability contract satisfied by each upstream vision API.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Rate-limiter key for this upstream.
    fn api_name(&self) -> &str;

    /// Hard cap on an input image, base64 overhead included.
    fn max_image_bytes(&self) -> usize;

    /// Run the prompt against the image and return the text response.
    async fn transcribe(&self, request: &VisionRequest<'_>) -> Result<String>;
}

/// Rough token cost of one vision call, used for the limiter's token
/// bucket. Counts prompt characters at 4/token, image bytes at the
/// tiled-vision rate, plus the full output budget.
pub fn estimate_tokens(prompt: &str, image_len: usize, max_output_tokens: u32) -> u64 {
    (prompt.len() / 4 + image_len / 1500) as u64 + max_output_tokens as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(ModelError::RateLimited { api: "gemini".into() }.is_retryable());
        assert!(ModelError::Timeout {
            api: "gemini".into(),
            seconds: 30
        }
        .is_retryable());
        assert!(ModelError::Unavailable {
            api: "anthropic".into(),
            message: "503".into()
        }
        .is_retryable());
        assert!(!ModelError::Auth { api: "gemini".into() }.is_retryable());
        assert!(!ModelError::Malformed {
            api: "gemini".into(),
            message: "no candidates".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ModelError::from_status("g", 429, String::new()),
            ModelError::RateLimited { .. }
        ));
        assert!(matches!(
            ModelError::from_status("g", 503, String::new()),
            ModelError::Unavailable { .. }
        ));
        assert!(matches!(
            ModelError::from_status("g", 401, String::new()),
            ModelError::Auth { .. }
        ));
        assert!(matches!(
            ModelError::from_status("g", 400, String::new()),
            ModelError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn test_estimate_tokens_scales() {
        let small = estimate_tokens("count the rows", 100_000, 64);
        let large = estimate_tokens("count the rows", 2_000_000, 64);
        assert!(large > small);
        assert!(small >= 64);
    }
}
