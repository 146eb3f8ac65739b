//! Queue table definitions.

use rusqlite::Connection;

use super::Result;

/// Create the queue tables if they do not exist.
///
/// `extraction_queue.status_id` carries the numeric codes consumed by
/// downstream systems: 1=pending, 2=processing, 3=extraction_done, 4=error,
/// 5=ocr_done, 6=ocr_processing.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_queue (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            document_type TEXT NOT NULL DEFAULT '',
            document_number TEXT NOT NULL DEFAULT '',
            params TEXT,
            status_id INTEGER NOT NULL DEFAULT 1,
            worker_id TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            processing_started_at TEXT,
            completed_at TEXT,
            last_error TEXT,
            last_error_at TEXT,
            ocr_attempts INTEGER NOT NULL DEFAULT 0,
            ocr_max_attempts INTEGER NOT NULL DEFAULT 3,
            ocr_worker_id TEXT,
            ocr_started_at TEXT,
            artifact_path TEXT,
            raw_text TEXT,
            boosted_text TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_queue_claim
            ON extraction_queue (status_id, kind, created_at);

        CREATE TABLE IF NOT EXISTS worker_status (
            id TEXT PRIMARY KEY,
            kinds TEXT NOT NULL DEFAULT '',
            ocr_capable INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            last_heartbeat TEXT NOT NULL,
            current_job_id TEXT,
            jobs_completed INTEGER NOT NULL DEFAULT 0,
            jobs_failed INTEGER NOT NULL DEFAULT 0,
            host TEXT,
            started_at TEXT NOT NULL
        );
    "#,
    )?;

    Ok(())
}
