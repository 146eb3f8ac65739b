//! Model-backed pipeline stages.
//!
//! Every upstream call goes through the shared rate limiter first; a
//! limiter stall sleeps and re-asks without touching the caller's retry
//! budget. Stage functions are plain async functions over page data so
//! they can run sequentially or under the parallel map unchanged.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::limiter::RateLimiter;
use crate::llm::{estimate_tokens, prompts, ModelError, VisionModel, VisionRequest};

use super::image_prep::{choose_payload, raw_threshold};
use super::types::PageImage;

/// Per-call timeouts from the concurrency contract.
pub const LINE_COUNT_TIMEOUT: Duration = Duration::from_secs(30);
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(120);
pub const BOOST_TIMEOUT: Duration = Duration::from_secs(60);

const LINE_COUNT_MAX_TOKENS: u32 = 64;
const EXTRACT_BASE_TOKENS: u32 = 1024;
const EXTRACT_TOKENS_PER_ROW: u32 = 96;
const EXTRACT_MAX_TOKENS: u32 = 8192;
const BOOST_MAX_TOKENS: u32 = 8192;

/// One rate-limited vision call against a page image.
async fn call_model(
    limiter: &RateLimiter,
    model: &dyn VisionModel,
    page: &PageImage,
    prompt: &str,
    max_output_tokens: u32,
    timeout: Duration,
) -> Result<String, ModelError> {
    let payload = choose_payload(page, raw_threshold(model.max_image_bytes()));
    let image = payload.bytes();
    let cost_tokens = estimate_tokens(prompt, image.len(), max_output_tokens);

    limiter
        .acquire(model.api_name(), 1, cost_tokens)
        .await
        .map_err(|e| ModelError::Unavailable {
            api: model.api_name().to_string(),
            message: format!("rate limiter: {}", e),
        })?;

    model
        .transcribe(&VisionRequest {
            prompt,
            image_png: image,
            max_output_tokens,
            timeout,
        })
        .await
}

/// Pull the first integer out of a line-count response.
pub fn parse_line_count(response: &str) -> Option<u32> {
    let re = Regex::new(r"\d+").ok()?;
    re.find(response)?.as_str().parse().ok()
}

/// Count data rows on one page.
///
/// With a consensus model configured, both models count independently and
/// the higher count wins; undercounting loses rows downstream while
/// overcounting only pads the extraction budget.
pub async fn line_count_page(
    limiter: &RateLimiter,
    primary: &dyn VisionModel,
    consensus: Option<&dyn VisionModel>,
    page: &PageImage,
) -> Result<u32, ModelError> {
    let response = call_model(
        limiter,
        primary,
        page,
        prompts::LINE_COUNT,
        LINE_COUNT_MAX_TOKENS,
        LINE_COUNT_TIMEOUT,
    )
    .await?;
    let primary_count = parse_line_count(&response).ok_or_else(|| ModelError::Malformed {
        api: primary.api_name().to_string(),
        message: format!("line count not found in {:?}", response),
    })?;

    let Some(consensus_model) = consensus else {
        return Ok(primary_count);
    };

    // Consensus is advisory; a failed second opinion never fails the page.
    match call_model(
        limiter,
        consensus_model,
        page,
        prompts::LINE_COUNT,
        LINE_COUNT_MAX_TOKENS,
        LINE_COUNT_TIMEOUT,
    )
    .await
    {
        Ok(second_response) => {
            let second = parse_line_count(&second_response).unwrap_or(0);
            if second != primary_count {
                debug!(
                    page = page.index + 1,
                    primary_count, second, "line count disagreement, higher wins"
                );
            }
            Ok(primary_count.max(second))
        }
        Err(e) => {
            debug!(page = page.index + 1, error = %e, "consensus line count failed");
            Ok(primary_count)
        }
    }
}

/// Extract the page's rows as pipe-delimited text. The expected row count
/// sizes the output budget.
pub async fn extract_page(
    limiter: &RateLimiter,
    model: &dyn VisionModel,
    page: &PageImage,
    expected_rows: Option<u32>,
) -> Result<String, ModelError> {
    let max_tokens = expected_rows
        .map(|rows| EXTRACT_BASE_TOKENS + rows * EXTRACT_TOKENS_PER_ROW)
        .unwrap_or(EXTRACT_MAX_TOKENS)
        .min(EXTRACT_MAX_TOKENS);

    let text = call_model(
        limiter,
        model,
        page,
        prompts::EXTRACT,
        max_tokens,
        EXTRACT_TIMEOUT,
    )
    .await?;
    Ok(text.trim().to_string())
}

/// Refine one page's raw extraction. An empty extraction is returned
/// as-is without spending a model call.
pub async fn boost_page(
    limiter: &RateLimiter,
    model: &dyn VisionModel,
    page: &PageImage,
    raw: &str,
) -> Result<String, ModelError> {
    if raw.trim().is_empty() {
        return Ok(raw.to_string());
    }

    let prompt = prompts::boost(raw);
    let text = call_model(
        limiter,
        model,
        page,
        &prompt,
        BOOST_MAX_TOKENS,
        BOOST_TIMEOUT,
    )
    .await?;
    Ok(text.trim().to_string())
}

/// Shared handle bundle the parallel map closures capture.
#[derive(Clone)]
pub struct StageContext {
    pub limiter: RateLimiter,
    pub extract_model: Arc<dyn VisionModel>,
    pub boost_model: Arc<dyn VisionModel>,
    pub consensus_model: Option<Arc<dyn VisionModel>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_count() {
        assert_eq!(parse_line_count("14"), Some(14));
        assert_eq!(parse_line_count("Il y a 23 lignes."), Some(23));
        assert_eq!(parse_line_count("  7\n"), Some(7));
        assert_eq!(parse_line_count("aucune"), None);
        assert_eq!(parse_line_count(""), None);
    }
}
