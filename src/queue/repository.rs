//! Per-environment queue repository.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, Row};

use crate::models::{Job, JobKind, JobStatus, SourceDescriptor};

use super::schema::init_schema;
use super::{connect, parse_datetime, parse_datetime_opt, timestamp, QueueError, Result};

/// Repository for one environment's `extraction_queue` and `worker_status`
/// tables. Cheap to clone; each operation opens its own connection, which
/// keeps claims safe across worker tasks and across processes.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    db_path: PathBuf,
    environment: String,
}

impl QueueRepository {
    /// Open the repository, creating tables on first use.
    pub fn new(db_path: &Path, environment: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    QueueError::NotFound(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let repo = Self {
            db_path: db_path.to_path_buf(),
            environment: environment.to_string(),
        };
        let conn = repo.connect()?;
        init_schema(&conn)?;
        Ok(repo)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    /// Insert a new job row. Used by the submission surface and by tests;
    /// production jobs normally arrive from the external front-end writing
    /// to the same table.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.connect()?;
        let params_json = match &job.source.params {
            serde_json::Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        conn.execute(
            r#"
            INSERT INTO extraction_queue (
                id, kind, document_type, document_number, params,
                status_id, worker_id, attempts, max_attempts, created_at,
                processing_started_at, completed_at, last_error, last_error_at,
                ocr_attempts, ocr_max_attempts, ocr_worker_id, ocr_started_at,
                artifact_path, raw_text, boosted_text
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
            params![
                job.id,
                job.kind.as_str(),
                job.source.document_type,
                job.source.document_number,
                params_json,
                job.status.code(),
                job.worker_id,
                job.attempts,
                job.max_attempts,
                timestamp(job.created_at),
                job.processing_started_at.map(timestamp),
                job.completed_at.map(timestamp),
                job.last_error,
                job.last_error_at.map(timestamp),
                job.ocr_attempts,
                job.ocr_max_attempts,
                job.ocr_worker_id,
                job.ocr_started_at.map(timestamp),
                job.artifact_path,
                job.raw_text,
                job.boosted_text,
            ],
        )?;
        Ok(())
    }

    /// Fetch a job by id.
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.connect()?;
        let result = conn.query_row(
            "SELECT * FROM extraction_queue WHERE id = ?",
            params![job_id],
            |row| self.row_to_job(row),
        );
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List jobs currently in a given status.
    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM extraction_queue WHERE status_id = ? ORDER BY created_at ASC, id ASC",
        )?;
        let jobs = stmt
            .query_map(params![status.code()], |row| self.row_to_job(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub(crate) fn row_to_job(&self, row: &Row<'_>) -> rusqlite::Result<Job> {
        let kind_str: String = row.get("kind")?;
        let kind = JobKind::from_str(&kind_str).unwrap_or(JobKind::Extraction);
        let status_code: i64 = row.get("status_id")?;
        let status = JobStatus::from_code(status_code).unwrap_or(JobStatus::Error);
        let params: Option<String> = row.get("params")?;
        let created_at: String = row.get("created_at")?;

        Ok(Job {
            id: row.get("id")?,
            environment: self.environment.clone(),
            kind,
            source: SourceDescriptor {
                document_type: row.get("document_type")?,
                document_number: row.get("document_number")?,
                params: params
                    .as_deref()
                    .and_then(|p| serde_json::from_str(p).ok())
                    .unwrap_or(serde_json::Value::Null),
            },
            status,
            worker_id: row.get("worker_id")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            created_at: parse_datetime(&created_at),
            processing_started_at: parse_datetime_opt(row.get("processing_started_at")?),
            completed_at: parse_datetime_opt(row.get("completed_at")?),
            last_error: row.get("last_error")?,
            last_error_at: parse_datetime_opt(row.get("last_error_at")?),
            ocr_attempts: row.get("ocr_attempts")?,
            ocr_max_attempts: row.get("ocr_max_attempts")?,
            ocr_worker_id: row.get("ocr_worker_id")?,
            ocr_started_at: parse_datetime_opt(row.get("ocr_started_at")?),
            artifact_path: row.get("artifact_path")?,
            raw_text: row.get("raw_text")?,
            boosted_text: row.get("boosted_text")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_repo() -> (tempfile::TempDir, QueueRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = QueueRepository::new(&dir.path().join("queue.db"), "dev").unwrap();
        (dir, repo)
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let (_dir, repo) = test_repo();
        let mut job = Job::new(
            "j1",
            "dev",
            JobKind::OcrIndex,
            SourceDescriptor::new("index", "1234567"),
        );
        job.source.params = serde_json::json!({"circonscription": "Montréal"});
        repo.insert_job(&job).unwrap();

        let loaded = repo.get_job("j1").unwrap().unwrap();
        assert_eq!(loaded.id, "j1");
        assert_eq!(loaded.environment, "dev");
        assert_eq!(loaded.kind, JobKind::OcrIndex);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.source.document_number, "1234567");
        assert_eq!(
            loaded.source.params["circonscription"],
            serde_json::json!("Montréal")
        );
        assert_eq!(loaded.attempts, 0);
        assert_eq!(loaded.max_attempts, 3);
    }

    #[test]
    fn test_get_missing_job() {
        let (_dir, repo) = test_repo();
        assert!(repo.get_job("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_by_status() {
        let (_dir, repo) = test_repo();
        for id in ["a", "b"] {
            repo.insert_job(&Job::new(
                id,
                "dev",
                JobKind::Req,
                SourceDescriptor::new("req", id),
            ))
            .unwrap();
        }
        let pending = repo.list_by_status(JobStatus::Pending).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(repo.list_by_status(JobStatus::Error).unwrap().is_empty());
    }
}
