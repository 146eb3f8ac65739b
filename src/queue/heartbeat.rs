//! Worker liveness writes against the `worker_status` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::models::{WorkerRecord, WorkerState};

use super::repository::QueueRepository;
use super::{parse_datetime, parse_datetime_opt, timestamp, Result};

/// One heartbeat write: the worker's current state and session counters.
#[derive(Debug, Clone)]
pub struct HeartbeatUpdate {
    pub worker_id: String,
    pub status: WorkerState,
    pub current_job_id: Option<String>,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
}

impl QueueRepository {
    /// Insert the initial liveness row for a newly registered worker.
    pub fn register_worker(&self, record: &WorkerRecord) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO worker_status (
                id, kinds, ocr_capable, status, last_heartbeat, current_job_id,
                jobs_completed, jobs_failed, host, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                kinds = excluded.kinds,
                ocr_capable = excluded.ocr_capable,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                started_at = excluded.started_at
            "#,
            params![
                record.id,
                record.capabilities_string(),
                record.ocr_capable as i64,
                record.status.as_str(),
                timestamp(record.last_heartbeat),
                record.current_job_id,
                record.jobs_completed,
                record.jobs_failed,
                record.host,
                timestamp(record.started_at),
            ],
        )?;
        Ok(())
    }

    /// Upsert worker liveness, stamped with the current time.
    pub fn heartbeat(&self, update: &HeartbeatUpdate) -> Result<()> {
        self.heartbeat_at(update, Utc::now())
    }

    /// Heartbeat with an explicit timestamp.
    ///
    /// The stored `last_heartbeat` never moves backwards: a write whose
    /// timestamp is not newer than the stored one leaves the row unchanged.
    pub fn heartbeat_at(&self, update: &HeartbeatUpdate, at: DateTime<Utc>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE worker_status
            SET status = ?2, last_heartbeat = ?3, current_job_id = ?4,
                jobs_completed = ?5, jobs_failed = ?6
            WHERE id = ?1 AND last_heartbeat < ?3
            "#,
            params![
                update.worker_id,
                update.status.as_str(),
                timestamp(at),
                update.current_job_id,
                update.jobs_completed,
                update.jobs_failed,
            ],
        )?;
        Ok(())
    }

    /// Transition a worker to offline. Offline is sticky regardless of
    /// heartbeat timing, so draining workers can always complete shutdown.
    pub fn mark_worker_offline(&self, worker_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE worker_status SET status = ?2, current_job_id = NULL WHERE id = ?1",
            params![worker_id, WorkerState::Offline.as_str()],
        )?;
        Ok(())
    }

    /// Fetch one worker's liveness row.
    pub fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let conn = self.connect()?;
        let result = conn.query_row(
            "SELECT * FROM worker_status WHERE id = ?",
            params![worker_id],
            row_to_worker,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All worker liveness rows.
    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM worker_status ORDER BY started_at ASC")?;
        let workers = stmt
            .query_map([], row_to_worker)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workers)
    }
}

fn row_to_worker(row: &Row<'_>) -> rusqlite::Result<WorkerRecord> {
    let kinds: String = row.get("kinds")?;
    let status: String = row.get("status")?;
    let ocr_capable: i64 = row.get("ocr_capable")?;
    let last_heartbeat: String = row.get("last_heartbeat")?;
    let started_at: String = row.get("started_at")?;

    Ok(WorkerRecord {
        id: row.get("id")?,
        kind_capabilities: WorkerRecord::parse_capabilities(&kinds),
        ocr_capable: ocr_capable != 0,
        status: WorkerState::from_str(&status).unwrap_or(WorkerState::Offline),
        last_heartbeat: parse_datetime(&last_heartbeat),
        current_job_id: row.get("current_job_id")?,
        jobs_completed: row.get("jobs_completed")?,
        jobs_failed: row.get("jobs_failed")?,
        host: row.get("host")?,
        started_at: parse_datetime(&started_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;
    use std::collections::BTreeSet;

    fn repo() -> (tempfile::TempDir, QueueRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = QueueRepository::new(&dir.path().join("queue.db"), "dev").unwrap();
        (dir, repo)
    }

    fn register(repo: &QueueRepository, id: &str) -> WorkerRecord {
        let caps: BTreeSet<JobKind> = [JobKind::Extraction].into();
        let record = WorkerRecord::new(id, caps, false);
        repo.register_worker(&record).unwrap();
        record
    }

    #[test]
    fn test_register_and_get() {
        let (_dir, repo) = repo();
        register(&repo, "w1");
        let loaded = repo.get_worker("w1").unwrap().unwrap();
        assert_eq!(loaded.id, "w1");
        assert_eq!(loaded.status, WorkerState::Idle);
        assert_eq!(loaded.kind_capabilities, [JobKind::Extraction].into());
    }

    #[test]
    fn test_heartbeat_advances() {
        let (_dir, repo) = repo();
        let record = register(&repo, "w1");

        let later = record.last_heartbeat + chrono::Duration::seconds(15);
        repo.heartbeat_at(
            &HeartbeatUpdate {
                worker_id: "w1".to_string(),
                status: WorkerState::Busy,
                current_job_id: Some("j1".to_string()),
                jobs_completed: 2,
                jobs_failed: 1,
            },
            later,
        )
        .unwrap();

        let loaded = repo.get_worker("w1").unwrap().unwrap();
        assert_eq!(loaded.status, WorkerState::Busy);
        assert_eq!(loaded.current_job_id.as_deref(), Some("j1"));
        assert_eq!(loaded.jobs_completed, 2);
        assert_eq!(loaded.last_heartbeat.timestamp_micros(), later.timestamp_micros());
    }

    #[test]
    fn test_stale_heartbeat_is_ignored() {
        let (_dir, repo) = repo();
        let record = register(&repo, "w1");

        let earlier = record.last_heartbeat - chrono::Duration::seconds(30);
        repo.heartbeat_at(
            &HeartbeatUpdate {
                worker_id: "w1".to_string(),
                status: WorkerState::Busy,
                current_job_id: Some("j1".to_string()),
                jobs_completed: 99,
                jobs_failed: 0,
            },
            earlier,
        )
        .unwrap();

        // Row unchanged: status, counters, and timestamp all kept.
        let loaded = repo.get_worker("w1").unwrap().unwrap();
        assert_eq!(loaded.status, WorkerState::Idle);
        assert_eq!(loaded.jobs_completed, 0);
        assert_eq!(
            loaded.last_heartbeat.timestamp_micros(),
            record.last_heartbeat.timestamp_micros()
        );
    }

    #[test]
    fn test_equal_timestamp_heartbeat_is_ignored() {
        let (_dir, repo) = repo();
        let record = register(&repo, "w1");

        repo.heartbeat_at(
            &HeartbeatUpdate {
                worker_id: "w1".to_string(),
                status: WorkerState::Draining,
                current_job_id: None,
                jobs_completed: 5,
                jobs_failed: 5,
            },
            record.last_heartbeat,
        )
        .unwrap();

        let loaded = repo.get_worker("w1").unwrap().unwrap();
        assert_eq!(loaded.status, WorkerState::Idle);
        assert_eq!(loaded.jobs_completed, 0);
    }

    #[test]
    fn test_mark_offline() {
        let (_dir, repo) = repo();
        register(&repo, "w1");
        repo.mark_worker_offline("w1").unwrap();
        let loaded = repo.get_worker("w1").unwrap().unwrap();
        assert_eq!(loaded.status, WorkerState::Offline);
        assert!(loaded.current_job_id.is_none());
    }

    #[test]
    fn test_list_workers() {
        let (_dir, repo) = repo();
        register(&repo, "w1");
        register(&repo, "w2");
        assert_eq!(repo.list_workers().unwrap().len(), 2);
    }
}
