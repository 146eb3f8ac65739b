//! Pipeline data types.
//!
//! Each stage consumes and produces plain page arrays indexed by page
//! number, independent of how the stage is scheduled; the same functions
//! run sequentially in tests and under the parallel map in production.

use thiserror::Error;

use crate::llm::ModelError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Artifact fetch failed. Fatal for this OCR attempt.
    #[error("artifact fetch failed: {0}")]
    Fetch(#[from] StorageError),
    /// PDF could not be rasterized. Fatal for this OCR attempt.
    #[error("rasterization failed: {0}")]
    Rasterize(String),
    #[error("image processing failed: {0}")]
    Image(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Every page of the document failed extraction.
    #[error("no page produced a transcript ({failed} pages failed)")]
    AllPagesFailed { failed: usize },
    /// Pages failed while the require-all-pages knob is on.
    #[error("pages failed with require-all-pages enabled: {pages:?}")]
    PagesFailed { pages: Vec<usize> },
}

impl PipelineError {
    /// Whether the OCR attempt may be retried on a later claim.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Model(e) => e.is_retryable(),
            // Fetch and rasterize failures are environmental; a later
            // attempt may find the artifact present and the store healthy.
            Self::Fetch(_) | Self::Rasterize(_) => true,
            Self::AllPagesFailed { .. } | Self::PagesFailed { .. } => true,
            Self::Image(_) => false,
        }
    }
}

/// One rasterized page with its retained upscale.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-based page index; page numbers in output are index + 1.
    pub index: usize,
    pub original_png: Vec<u8>,
    pub upscaled_png: Vec<u8>,
}

/// Transcripts for one page after extract and boost.
#[derive(Debug, Clone, Default)]
pub struct PageText {
    pub raw: String,
    pub boosted: String,
}

/// Final pipeline output for a document.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub raw_text: String,
    pub boosted_text: String,
    /// Pages (1-based) that contributed an empty body, with their errors.
    pub page_errors: Vec<(usize, String)>,
}

impl OcrOutcome {
    /// Human-readable warning recorded on the job when some pages failed.
    pub fn warning(&self) -> Option<String> {
        if self.page_errors.is_empty() {
            return None;
        }
        let detail = self
            .page_errors
            .iter()
            .map(|(page, error)| format!("page {}: {}", page, error))
            .collect::<Vec<_>>()
            .join("; ");
        Some(format!("ocr completed with page failures: {}", detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_mentions_failed_pages() {
        let outcome = OcrOutcome {
            raw_text: String::new(),
            boosted_text: String::new(),
            page_errors: vec![(3, "timed out".to_string())],
        };
        let warning = outcome.warning().unwrap();
        assert!(warning.contains("page 3"));
        assert!(warning.contains("timed out"));
    }

    #[test]
    fn test_no_warning_when_clean() {
        let outcome = OcrOutcome {
            raw_text: "x".to_string(),
            boosted_text: "x".to_string(),
            page_errors: vec![],
        };
        assert!(outcome.warning().is_none());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Rasterize("pdftoppm exited 1".into()).is_retryable());
        assert!(!PipelineError::Image("bad png".into()).is_retryable());
        assert!(PipelineError::AllPagesFailed { failed: 4 }.is_retryable());
    }
}
