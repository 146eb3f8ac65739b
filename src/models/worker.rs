//! Worker liveness models.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobKind;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Draining,
    Offline,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "draining" => Some(Self::Draining),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Liveness row for one worker, upserted on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Process-unique random id.
    pub id: String,
    /// Job kinds this worker can claim for extraction.
    pub kind_capabilities: BTreeSet<JobKind>,
    /// Whether this worker also claims OCR work.
    pub ocr_capable: bool,
    pub status: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub current_job_id: Option<String>,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub host: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Create a record for a newly registered worker.
    pub fn new(id: impl Into<String>, kind_capabilities: BTreeSet<JobKind>, ocr_capable: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind_capabilities,
            ocr_capable,
            status: WorkerState::Idle,
            last_heartbeat: now,
            current_job_id: None,
            jobs_completed: 0,
            jobs_failed: 0,
            host: hostname::get().ok().and_then(|h| h.into_string().ok()),
            started_at: now,
        }
    }

    /// Serialize capabilities for the worker_status row.
    pub fn capabilities_string(&self) -> String {
        self.kind_capabilities
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a capabilities column back into a kind set. Unknown entries
    /// are dropped.
    pub fn parse_capabilities(s: &str) -> BTreeSet<JobKind> {
        s.split(',')
            .filter_map(|part| JobKind::from_str(part.trim()))
            .collect()
    }

    /// Check whether the worker has been silent past the given threshold.
    pub fn is_dead(&self, threshold_secs: i64) -> bool {
        (Utc::now() - self.last_heartbeat).num_seconds() > threshold_secs
    }
}
