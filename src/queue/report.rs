//! Outcome reporting: terminal writes and retry bookkeeping.

use chrono::Utc;
use rusqlite::params;

use crate::models::{JobOutcome, JobStatus};

use super::repository::QueueRepository;
use super::{timestamp, QueueError, Result};

impl QueueRepository {
    /// Write a successful outcome and advance the job's status.
    ///
    /// An extraction success clears extraction ownership and lands on
    /// `EXTRACTION_DONE`; an OCR success clears OCR ownership and lands on
    /// `OCR_DONE` with both transcripts persisted.
    pub fn report_success(&self, job_id: &str, outcome: &JobOutcome) -> Result<()> {
        let conn = self.connect()?;
        let now = timestamp(Utc::now());

        let updated = match outcome {
            JobOutcome::Extracted { artifact_path } => conn.execute(
                r#"
                UPDATE extraction_queue
                SET status_id = ?1, worker_id = NULL, artifact_path = ?2, completed_at = ?3
                WHERE id = ?4 AND status_id = ?5
                "#,
                params![
                    JobStatus::ExtractionDone.code(),
                    artifact_path,
                    now,
                    job_id,
                    JobStatus::Processing.code(),
                ],
            )?,
            JobOutcome::Ocr {
                raw_text,
                boosted_text,
                warning,
            } => conn.execute(
                r#"
                UPDATE extraction_queue
                SET status_id = ?1, ocr_worker_id = NULL, raw_text = ?2,
                    boosted_text = ?3, completed_at = ?4,
                    last_error = COALESCE(?5, last_error),
                    last_error_at = CASE WHEN ?5 IS NULL THEN last_error_at ELSE ?4 END
                WHERE id = ?6 AND status_id = ?7
                "#,
                params![
                    JobStatus::OcrDone.code(),
                    raw_text,
                    boosted_text,
                    now,
                    warning,
                    job_id,
                    JobStatus::OcrProcessing.code(),
                ],
            )?,
        };

        if updated != 1 {
            return Err(QueueError::NotFound(format!(
                "job {} not in a processing state",
                job_id
            )));
        }
        Ok(())
    }

    /// Record an extraction failure.
    ///
    /// With retry budget left and a retryable error, the job returns to
    /// `PENDING` unowned with `attempts` incremented; otherwise it lands on
    /// `ERROR`. Attempts only ever increase, and only on this transition
    /// out of `PROCESSING`.
    pub fn report_failure(&self, job_id: &str, error: &str, retry_allowed: bool) -> Result<()> {
        self.fail(
            job_id,
            error,
            retry_allowed,
            JobStatus::Processing,
            false,
        )
    }

    /// Record an OCR failure: back to `EXTRACTION_DONE` while `ocr_attempts`
    /// remain, `ERROR` once the OCR budget is exhausted.
    pub fn report_ocr_failure(&self, job_id: &str, error: &str, retry_allowed: bool) -> Result<()> {
        self.fail(
            job_id,
            error,
            retry_allowed,
            JobStatus::OcrProcessing,
            true,
        )
    }

    fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry_allowed: bool,
        expected: JobStatus,
        ocr: bool,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<()> = (|| {
            let (attempts, max_attempts): (i64, i64) = {
                let (attempts_col, max_col) = if ocr {
                    ("ocr_attempts", "ocr_max_attempts")
                } else {
                    ("attempts", "max_attempts")
                };
                conn.query_row(
                    &format!(
                        "SELECT {}, {} FROM extraction_queue WHERE id = ?1 AND status_id = ?2",
                        attempts_col, max_col
                    ),
                    params![job_id, expected.code()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => QueueError::NotFound(format!(
                        "job {} not in a processing state",
                        job_id
                    )),
                    other => other.into(),
                })?
            };

            let next_attempts = attempts + 1;
            let retry = retry_allowed && next_attempts < max_attempts;
            let next_status = if retry {
                expected.pending_state()
            } else {
                JobStatus::Error
            };
            let now = timestamp(Utc::now());

            let update = if ocr {
                "UPDATE extraction_queue \
                 SET status_id = ?1, ocr_worker_id = NULL, ocr_attempts = ?2, \
                     last_error = ?3, last_error_at = ?4 \
                 WHERE id = ?5 AND status_id = ?6"
            } else {
                "UPDATE extraction_queue \
                 SET status_id = ?1, worker_id = NULL, attempts = ?2, \
                     last_error = ?3, last_error_at = ?4 \
                 WHERE id = ?5 AND status_id = ?6"
            };
            conn.execute(
                update,
                params![
                    next_status.code(),
                    next_attempts,
                    error,
                    now,
                    job_id,
                    expected.code(),
                ],
            )?;
            Ok(())
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
