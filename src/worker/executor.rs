//! Extractor executor interface.
//!
//! Concrete registry automation (login flows, navigation, download) lives
//! outside the core; executors are wired in at startup through the
//! kind-to-executor registry and only need to satisfy [`Extractor`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Job, JobKind};

/// Result of a successful extraction: where the artifact landed.
#[derive(Debug, Clone)]
pub struct ExtractionArtifact {
    /// Blob storage path, relative to its bucket or fully qualified.
    pub artifact_path: String,
}

/// Failure reported by an executor, classified for the retry policy.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ExtractorError {
    /// Executor-specific error family (e.g. "site-unavailable",
    /// "document-not-found", "login-failed").
    pub kind: String,
    pub message: String,
    /// Whether the job may be retried after this failure.
    pub retryable: bool,
}

impl ExtractorError {
    pub fn retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// A claimed-job executor: produce a stored artifact and return its path.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn run(&self, job: &Job) -> Result<ExtractionArtifact, ExtractorError>;
}

/// Startup wiring from job kind to its executor.
pub type ExtractorRegistry = HashMap<JobKind, Arc<dyn Extractor>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let transient = ExtractorError::retryable("site-unavailable", "503 from registry");
        assert!(transient.retryable);
        assert_eq!(transient.kind, "site-unavailable");

        let terminal = ExtractorError::terminal("document-not-found", "no such number");
        assert!(!terminal.retryable);
        assert!(terminal.to_string().contains("document-not-found"));
    }
}
