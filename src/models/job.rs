//! Job models for the extraction queue.
//!
//! A job moves through a fixed state machine driven by worker claims and
//! health-monitor resets. Status codes are stored numerically (1-6) for
//! compatibility with the downstream consumers of the queue tables; the
//! numeric mapping lives here and nowhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a job represents.
///
/// Extraction kinds are handled by browser-automation executors; the two
/// OCR-capable kinds continue into the OCR pipeline after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Extraction,
    OcrIndex,
    OcrActe,
    Req,
    Rdprm,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::OcrIndex => "ocr_index",
            Self::OcrActe => "ocr_acte",
            Self::Req => "req",
            Self::Rdprm => "rdprm",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(Self::Extraction),
            "ocr_index" => Some(Self::OcrIndex),
            "ocr_acte" => Some(Self::OcrActe),
            "req" => Some(Self::Req),
            "rdprm" => Some(Self::Rdprm),
            _ => None,
        }
    }

    /// Whether jobs of this kind continue into the OCR pipeline after a
    /// successful extraction.
    pub fn is_ocr_capable(&self) -> bool {
        matches!(self, Self::OcrIndex | Self::OcrActe)
    }

    /// Blob storage bucket for artifacts of this kind.
    pub fn bucket(&self) -> &'static str {
        match self {
            Self::OcrActe => "actes",
            _ => "documents",
        }
    }

    pub fn all() -> [JobKind; 5] {
        [
            Self::Extraction,
            Self::OcrIndex,
            Self::OcrActe,
            Self::Req,
            Self::Rdprm,
        ]
    }
}

/// Job status with its fixed numeric storage codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    ExtractionDone,
    Error,
    OcrDone,
    OcrProcessing,
}

impl JobStatus {
    /// Numeric code stored in the queue tables. Preserved bit-for-bit for
    /// external consumers.
    pub fn code(&self) -> i64 {
        match self {
            Self::Pending => 1,
            Self::Processing => 2,
            Self::ExtractionDone => 3,
            Self::Error => 4,
            Self::OcrDone => 5,
            Self::OcrProcessing => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Pending),
            2 => Some(Self::Processing),
            3 => Some(Self::ExtractionDone),
            4 => Some(Self::Error),
            5 => Some(Self::OcrDone),
            6 => Some(Self::OcrProcessing),
            _ => None,
        }
    }

    /// Whether a job in this status is owned by a worker.
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::Processing | Self::OcrProcessing)
    }

    /// Whether no further transitions are possible from this status.
    pub fn is_terminal(&self, kind: JobKind) -> bool {
        match self {
            Self::Error | Self::OcrDone => true,
            Self::ExtractionDone => !kind.is_ocr_capable(),
            _ => false,
        }
    }

    /// The claimable state a processing job reverts to on retry or reset.
    pub fn pending_state(&self) -> JobStatus {
        match self {
            Self::OcrProcessing => Self::ExtractionDone,
            _ => Self::Pending,
        }
    }
}

/// What a job targets: a registry document identified by type and number,
/// plus kind-specific parameters (circonscription, cadastre, date ranges).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub document_type: String,
    pub document_number: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl SourceDescriptor {
    pub fn new(document_type: impl Into<String>, document_number: impl Into<String>) -> Self {
        Self {
            document_type: document_type.into(),
            document_number: document_number.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// A unit of work in one environment's extraction queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Logical queue this job lives in (dev, staging, prod).
    pub environment: String,
    pub kind: JobKind,
    pub source: SourceDescriptor,
    pub status: JobStatus,
    /// Owning worker while status is Processing.
    pub worker_id: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// OCR stage fields; unused for kinds that stop at extraction.
    pub ocr_attempts: i64,
    pub ocr_max_attempts: i64,
    pub ocr_worker_id: Option<String>,
    pub ocr_started_at: Option<DateTime<Utc>>,
    /// Reference to the extracted PDF in blob storage.
    pub artifact_path: Option<String>,
    pub raw_text: Option<String>,
    pub boosted_text: Option<String>,
}

impl Job {
    /// Create a new pending job with the default retry budget.
    pub fn new(id: impl Into<String>, environment: impl Into<String>, kind: JobKind, source: SourceDescriptor) -> Self {
        Self {
            id: id.into(),
            environment: environment.into(),
            kind,
            source,
            status: JobStatus::Pending,
            worker_id: None,
            attempts: 0,
            max_attempts: 3,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
            last_error: None,
            last_error_at: None,
            ocr_attempts: 0,
            ocr_max_attempts: 3,
            ocr_worker_id: None,
            ocr_started_at: None,
            artifact_path: None,
            raw_text: None,
            boosted_text: None,
        }
    }
}

/// Result of executing a job, reported back through the queue gateway.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Extraction produced an artifact; OCR-capable kinds continue from here.
    Extracted { artifact_path: String },
    /// OCR produced merged transcripts.
    Ocr {
        raw_text: String,
        boosted_text: String,
        /// Page-level errors worth recording even on overall success.
        warning: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_fixed() {
        assert_eq!(JobStatus::Pending.code(), 1);
        assert_eq!(JobStatus::Processing.code(), 2);
        assert_eq!(JobStatus::ExtractionDone.code(), 3);
        assert_eq!(JobStatus::Error.code(), 4);
        assert_eq!(JobStatus::OcrDone.code(), 5);
        assert_eq!(JobStatus::OcrProcessing.code(), 6);
    }

    #[test]
    fn test_status_code_roundtrip() {
        for code in 1..=6 {
            let status = JobStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(JobStatus::from_code(0), None);
        assert_eq!(JobStatus::from_code(7), None);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in JobKind::all() {
            assert_eq!(JobKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::from_str("unknown"), None);
    }

    #[test]
    fn test_ocr_capable_kinds() {
        assert!(JobKind::OcrIndex.is_ocr_capable());
        assert!(JobKind::OcrActe.is_ocr_capable());
        assert!(!JobKind::Extraction.is_ocr_capable());
        assert!(!JobKind::Req.is_ocr_capable());
        assert!(!JobKind::Rdprm.is_ocr_capable());
    }

    #[test]
    fn test_pending_state() {
        assert_eq!(JobStatus::Processing.pending_state(), JobStatus::Pending);
        assert_eq!(
            JobStatus::OcrProcessing.pending_state(),
            JobStatus::ExtractionDone
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Error.is_terminal(JobKind::Extraction));
        assert!(JobStatus::OcrDone.is_terminal(JobKind::OcrIndex));
        // ExtractionDone is terminal only for kinds that skip OCR
        assert!(JobStatus::ExtractionDone.is_terminal(JobKind::Req));
        assert!(!JobStatus::ExtractionDone.is_terminal(JobKind::OcrIndex));
        assert!(!JobStatus::Pending.is_terminal(JobKind::Extraction));
    }

    #[test]
    fn test_bucket_per_kind() {
        assert_eq!(JobKind::OcrActe.bucket(), "actes");
        assert_eq!(JobKind::OcrIndex.bucket(), "documents");
    }
}
