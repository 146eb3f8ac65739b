//! Atomic job claiming.

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::params;

use crate::models::{Job, JobKind, JobStatus};

use super::repository::QueueRepository;
use super::{timestamp, Result};

impl QueueRepository {
    /// Atomically claim the oldest pending job whose kind is in `kind_set`.
    ///
    /// Selection and the conditional ownership update run inside a single
    /// `BEGIN IMMEDIATE` transaction; the update is additionally filtered on
    /// `worker_id IS NULL` so a row claimed between statements is never
    /// double-assigned. Returns `Ok(None)` when no job is available.
    pub fn claim_next(&self, kind_set: &BTreeSet<JobKind>, worker_id: &str) -> Result<Option<Job>> {
        if kind_set.is_empty() {
            return Ok(None);
        }
        self.claim(
            JobStatus::Pending,
            JobStatus::Processing,
            kind_set,
            worker_id,
            false,
        )
    }

    /// Atomically claim the oldest extraction-done job of an OCR-capable
    /// kind, setting `ocr_worker_id` and advancing to OCR processing.
    pub fn claim_next_ocr(&self, worker_id: &str) -> Result<Option<Job>> {
        let ocr_kinds: BTreeSet<JobKind> = JobKind::all()
            .into_iter()
            .filter(|k| k.is_ocr_capable())
            .collect();
        self.claim(
            JobStatus::ExtractionDone,
            JobStatus::OcrProcessing,
            &ocr_kinds,
            worker_id,
            true,
        )
    }

    fn claim(
        &self,
        from: JobStatus,
        to: JobStatus,
        kind_set: &BTreeSet<JobKind>,
        worker_id: &str,
        ocr: bool,
    ) -> Result<Option<Job>> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Option<Job>> = (|| {
            let kinds_sql = kind_set
                .iter()
                .map(|k| format!("'{}'", k.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let owner_column = if ocr { "ocr_worker_id" } else { "worker_id" };

            // Oldest first; ties broken by lexicographic id for determinism.
            let select = format!(
                "SELECT id FROM extraction_queue \
                 WHERE status_id = ?1 AND {owner} IS NULL AND kind IN ({kinds}) \
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                owner = owner_column,
                kinds = kinds_sql,
            );

            let job_id: Option<String> = match conn.query_row(&select, params![from.code()], |row| {
                row.get(0)
            }) {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            let Some(job_id) = job_id else {
                return Ok(None);
            };

            let now = timestamp(Utc::now());
            let update = if ocr {
                "UPDATE extraction_queue \
                 SET status_id = ?1, ocr_worker_id = ?2, ocr_started_at = ?3 \
                 WHERE id = ?4 AND status_id = ?5 AND ocr_worker_id IS NULL"
            } else {
                "UPDATE extraction_queue \
                 SET status_id = ?1, worker_id = ?2, processing_started_at = ?3 \
                 WHERE id = ?4 AND status_id = ?5 AND worker_id IS NULL"
            };
            let updated = conn.execute(
                update,
                params![to.code(), worker_id, now, job_id, from.code()],
            )?;

            if updated != 1 {
                // Lost the race inside this transaction window; treat as empty.
                return Ok(None);
            }

            let job = conn.query_row(
                "SELECT * FROM extraction_queue WHERE id = ?",
                params![job_id],
                |row| self.row_to_job(row),
            )?;
            Ok(Some(job))
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
}
