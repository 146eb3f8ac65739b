//! Queue gateway: typed access to the per-environment extraction queues.
//!
//! Each environment (dev, staging, prod) is a separate SQLite database
//! holding an `extraction_queue` table and a sibling `worker_status` table.
//! Status codes are numeric (1-6) at this boundary and nowhere else; see
//! [`crate::models::JobStatus`].
//!
//! All claim operations are single atomic transactions so that N concurrent
//! claimers against one pending job produce exactly one owner.

mod claim;
mod heartbeat;
mod maintenance;
mod report;
mod repository;
mod schema;

pub use heartbeat::HeartbeatUpdate;
pub use maintenance::{QueueStats, MONITOR_AUTHOR};
pub use repository::QueueRepository;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Fixed-width RFC 3339 timestamp for queue rows.
///
/// Microsecond precision with a literal `Z` keeps all stored timestamps the
/// same length, so lexicographic comparison in SQL matches chronological
/// order. The heartbeat monotonicity guard relies on this.
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Create a database connection with settings for concurrent claimers.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL mode: multiple readers plus one writer. Persists per database.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;

    Ok(conn)
}

/// Execute a queue write with bounded retries on lock contention.
///
/// Up to 3 attempts with exponential backoff and jitter. Non-lock errors
/// surface immediately.
pub fn with_retry<T, F>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut delay_ms: u64 = 100;

    for attempt in 0..MAX_ATTEMPTS {
        match operation() {
            Ok(result) => return Ok(result),
            Err(QueueError::Database(ref e))
                if is_lock_error(e) && attempt < MAX_ATTEMPTS - 1 =>
            {
                let jittered = crate::utils::jitter_ms(delay_ms);
                tracing::debug!(
                    "Queue write contended, retrying in {}ms (attempt {}/{})",
                    jittered,
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                std::thread::sleep(Duration::from_millis(jittered));
                delay_ms *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    // The final attempt either returned above or exits here.
    operation()
}

fn is_lock_error(e: &rusqlite::Error) -> bool {
    let text = e.to_string();
    text.contains("database is locked")
        || text.contains("SQLITE_BUSY")
        || text.contains("SQLITE_LOCKED")
}

/// One configured logical queue.
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    /// Whether OCR claiming is enabled against this environment.
    pub ocr_enabled: bool,
}

/// Gateway over every configured environment queue.
///
/// Workers, the dispatcher, and the health monitor all go through this;
/// it is the only component that touches the backing store.
#[derive(Clone)]
pub struct QueueGateway {
    environments: Arc<Vec<(Environment, QueueRepository)>>,
}

impl QueueGateway {
    /// Open a repository per configured environment.
    pub fn open(configs: &[(String, std::path::PathBuf, bool)]) -> Result<Self> {
        let mut environments = Vec::with_capacity(configs.len());
        for (name, db_path, ocr_enabled) in configs {
            let repo = QueueRepository::new(db_path, name)?;
            environments.push((
                Environment {
                    name: name.clone(),
                    ocr_enabled: *ocr_enabled,
                },
                repo,
            ));
        }
        Ok(Self {
            environments: Arc::new(environments),
        })
    }

    /// Enumerate configured logical queues, in configuration order.
    pub fn list_environments(&self) -> Vec<Environment> {
        self.environments.iter().map(|(env, _)| env.clone()).collect()
    }

    /// Repository for one environment.
    pub fn repository(&self, environment: &str) -> Result<&QueueRepository> {
        self.environments
            .iter()
            .find(|(env, _)| env.name == environment)
            .map(|(_, repo)| repo)
            .ok_or_else(|| QueueError::UnknownEnvironment(environment.to_string()))
    }

    /// All repositories with their environment metadata.
    pub fn repositories(&self) -> impl Iterator<Item = (&Environment, &QueueRepository)> {
        self.environments.iter().map(|(env, repo)| (env, repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_fixed_width() {
        let a = timestamp(Utc::now());
        let b = timestamp(Utc::now() + chrono::Duration::days(30));
        assert_eq!(a.len(), b.len());
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn test_timestamp_lexicographic_order() {
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(90);
        assert!(timestamp(early) < timestamp(late));
    }

    #[test]
    fn test_parse_datetime_roundtrip() {
        let now = Utc::now();
        let parsed = parse_datetime(&timestamp(now));
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_parse_datetime_invalid_is_epoch() {
        assert_eq!(parse_datetime("garbage"), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_gateway_unknown_environment() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = QueueGateway::open(&[(
            "dev".to_string(),
            dir.path().join("dev.db"),
            true,
        )])
        .unwrap();
        assert!(gateway.repository("dev").is_ok());
        assert!(matches!(
            gateway.repository("prod"),
            Err(QueueError::UnknownEnvironment(_))
        ));
    }
}
