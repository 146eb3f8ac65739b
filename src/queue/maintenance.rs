//! Queue repair operations used by the health monitor.
//!
//! These are the only writes that move a job out of a processing state
//! without a claim; every such move records a synthetic `last_error`
//! naming the monitor as the author.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::models::{JobStatus, WorkerState};

use super::repository::QueueRepository;
use super::{timestamp, Result};

/// Author tag recorded on monitor-initiated resets.
pub const MONITOR_AUTHOR: &str = "health-monitor";

/// Aggregate counts for one environment, used by the monitor snapshot and
/// the status command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub extraction_done: i64,
    pub error: i64,
    pub ocr_done: i64,
    pub ocr_processing: i64,
    pub active_workers: i64,
}

impl QueueStats {
    pub fn in_flight(&self) -> i64 {
        self.processing + self.ocr_processing
    }
}

impl QueueRepository {
    /// Reclaim jobs stuck in a processing state past the threshold.
    ///
    /// Stalled extraction jobs revert to `PENDING` and stalled OCR jobs to
    /// `EXTRACTION_DONE`, with the corresponding attempt counter
    /// incremented; a job whose budget is exhausted by the reset lands on
    /// `ERROR` instead, mirroring the failure path. Returns the number of
    /// jobs moved.
    pub fn reset_stalled(&self, threshold: Duration) -> Result<u64> {
        let cutoff = Utc::now() - threshold;
        let mut count = 0;
        count += self.reset_stalled_in(
            JobStatus::Processing,
            "processing_started_at",
            "worker_id",
            "attempts",
            "max_attempts",
            cutoff,
        )?;
        count += self.reset_stalled_in(
            JobStatus::OcrProcessing,
            "ocr_started_at",
            "ocr_worker_id",
            "ocr_attempts",
            "ocr_max_attempts",
            cutoff,
        )?;
        Ok(count)
    }

    fn reset_stalled_in(
        &self,
        stalled: JobStatus,
        started_column: &str,
        owner_column: &str,
        attempts_column: &str,
        max_column: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<u64> = (|| {
            let select = format!(
                "SELECT id, {attempts}, {max} FROM extraction_queue \
                 WHERE status_id = ?1 AND {started} IS NOT NULL AND {started} < ?2",
                attempts = attempts_column,
                max = max_column,
                started = started_column,
            );
            let mut stmt = conn.prepare(&select)?;
            let stalled_rows: Vec<(String, i64, i64)> = stmt
                .query_map(params![stalled.code(), timestamp(cutoff)], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let now = timestamp(Utc::now());
            let mut count = 0u64;
            for (job_id, attempts, max_attempts) in stalled_rows {
                let next_attempts = attempts + 1;
                let next_status = if next_attempts < max_attempts {
                    stalled.pending_state()
                } else {
                    JobStatus::Error
                };
                let error = format!(
                    "{}: reclaimed after stall in {:?}",
                    MONITOR_AUTHOR, stalled
                );
                let update = format!(
                    "UPDATE extraction_queue \
                     SET status_id = ?1, {owner} = NULL, {attempts} = ?2, \
                         last_error = ?3, last_error_at = ?4 \
                     WHERE id = ?5 AND status_id = ?6",
                    owner = owner_column,
                    attempts = attempts_column,
                );
                count += conn.execute(
                    &update,
                    params![
                        next_status.code(),
                        next_attempts,
                        error,
                        now,
                        job_id,
                        stalled.code(),
                    ],
                )? as u64;
            }
            Ok(count)
        })();

        match &result {
            Ok(_) => {
                conn.execute("COMMIT", [])?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }
        result
    }

    /// Mark workers silent past the threshold as offline, releasing any job
    /// they still own. Returns the number of workers evicted.
    pub fn evict_dead_workers(&self, threshold: Duration) -> Result<u64> {
        let cutoff = timestamp(Utc::now() - threshold);
        let conn = self.connect()?;

        let mut stmt = conn.prepare(
            "SELECT id FROM worker_status WHERE status != ?1 AND last_heartbeat < ?2",
        )?;
        let dead: Vec<String> = stmt
            .query_map(params![WorkerState::Offline.as_str(), cutoff], |row| {
                row.get(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for worker_id in &dead {
            self.release_jobs_of(&conn, worker_id)?;
            conn.execute(
                "UPDATE worker_status SET status = ?1, current_job_id = NULL WHERE id = ?2",
                params![WorkerState::Offline.as_str(), worker_id],
            )?;
            tracing::warn!("Evicted dead worker {}", worker_id);
        }

        Ok(dead.len() as u64)
    }

    fn release_jobs_of(&self, conn: &rusqlite::Connection, worker_id: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        for (stalled, owner_column, attempts_column, max_column) in [
            (JobStatus::Processing, "worker_id", "attempts", "max_attempts"),
            (
                JobStatus::OcrProcessing,
                "ocr_worker_id",
                "ocr_attempts",
                "ocr_max_attempts",
            ),
        ] {
            let error = format!("{}: owner {} declared dead", MONITOR_AUTHOR, worker_id);
            // Same revert-or-error rule as reset_stalled, expressed per row.
            let update = format!(
                "UPDATE extraction_queue \
                 SET status_id = CASE WHEN {attempts} + 1 < {max} THEN ?1 ELSE ?2 END, \
                     {owner} = NULL, {attempts} = {attempts} + 1, \
                     last_error = ?3, last_error_at = ?4 \
                 WHERE status_id = ?5 AND {owner} = ?6",
                owner = owner_column,
                attempts = attempts_column,
                max = max_column,
            );
            conn.execute(
                &update,
                params![
                    stalled.pending_state().code(),
                    JobStatus::Error.code(),
                    error,
                    now,
                    stalled.code(),
                    worker_id,
                ],
            )?;
        }
        Ok(())
    }

    /// Aggregate queue and worker counts for this environment.
    pub fn stats(&self, dead_worker_threshold: Duration) -> Result<QueueStats> {
        let conn = self.connect()?;
        let mut stats = QueueStats::default();

        let mut stmt =
            conn.prepare("SELECT status_id, COUNT(*) FROM extraction_queue GROUP BY status_id")?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (code, count) in rows {
            match JobStatus::from_code(code) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::ExtractionDone) => stats.extraction_done = count,
                Some(JobStatus::Error) => stats.error = count,
                Some(JobStatus::OcrDone) => stats.ocr_done = count,
                Some(JobStatus::OcrProcessing) => stats.ocr_processing = count,
                None => {}
            }
        }

        let cutoff = timestamp(Utc::now() - dead_worker_threshold);
        stats.active_workers = conn.query_row(
            "SELECT COUNT(*) FROM worker_status WHERE status != ?1 AND last_heartbeat >= ?2",
            params![WorkerState::Offline.as_str(), cutoff],
            |row| row.get(0),
        )?;

        Ok(stats)
    }
}
