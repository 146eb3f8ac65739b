//! Allocation stores: in-memory for a single process, SQLite for a shared
//! fleet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::{Admission, Allocation, CapacityError, Result};

#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// Record the allocation iff the aggregate including it stays within
    /// the ceilings. Check and insert are atomic.
    async fn try_allocate(
        &self,
        allocation: &Allocation,
        max_cpu: f64,
        max_ram: f64,
    ) -> Result<Admission>;

    /// Drop a worker's allocation.
    async fn release(&self, worker_id: &str) -> Result<()>;

    /// Aggregate (cpu, ram) across live allocations.
    async fn usage(&self) -> Result<(f64, f64)>;
}

/// Process-local allocations behind a mutex.
pub struct MemoryCapacityStore {
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl MemoryCapacityStore {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCapacityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapacityStore for MemoryCapacityStore {
    async fn try_allocate(
        &self,
        allocation: &Allocation,
        max_cpu: f64,
        max_ram: f64,
    ) -> Result<Admission> {
        let mut allocations = self.allocations.lock().await;
        let (cpu, ram) = allocations.values().fold((0.0, 0.0), |(c, r), a| {
            (c + a.cpu_units, r + a.ram_units)
        });

        if cpu + allocation.cpu_units > max_cpu {
            return Ok(Admission::Deny {
                reason: format!(
                    "cpu ceiling: {:.1} + {:.1} > {:.1}",
                    cpu, allocation.cpu_units, max_cpu
                ),
            });
        }
        if ram + allocation.ram_units > max_ram {
            return Ok(Admission::Deny {
                reason: format!(
                    "ram ceiling: {:.1} + {:.1} > {:.1}",
                    ram, allocation.ram_units, max_ram
                ),
            });
        }

        allocations.insert(allocation.worker_id.clone(), allocation.clone());
        Ok(Admission::Admit)
    }

    async fn release(&self, worker_id: &str) -> Result<()> {
        self.allocations.lock().await.remove(worker_id);
        Ok(())
    }

    async fn usage(&self) -> Result<(f64, f64)> {
        let allocations = self.allocations.lock().await;
        Ok(allocations.values().fold((0.0, 0.0), |(c, r), a| {
            (c + a.cpu_units, r + a.ram_units)
        }))
    }
}

/// Allocations in the shared state database, for deployments running
/// workers in several processes against one budget.
pub struct SqliteCapacityStore {
    db_path: PathBuf,
}

impl SqliteCapacityStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS capacity_allocations (
                worker_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                cpu_units REAL NOT NULL,
                ram_units REAL NOT NULL,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        )
        .map_err(|e| CapacityError::Database(e.to_string()))?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| CapacityError::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 30000;",
        )
        .map_err(|e| CapacityError::Database(e.to_string()))?;
        Ok(conn)
    }
}

#[async_trait]
impl CapacityStore for SqliteCapacityStore {
    async fn try_allocate(
        &self,
        allocation: &Allocation,
        max_cpu: f64,
        max_ram: f64,
    ) -> Result<Admission> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(|e| CapacityError::Database(e.to_string()))?;

        let result: Result<Admission> = (|| {
            let (cpu, ram): (f64, f64) = conn
                .query_row(
                    "SELECT COALESCE(SUM(cpu_units), 0), COALESCE(SUM(ram_units), 0) \
                     FROM capacity_allocations",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| CapacityError::Database(e.to_string()))?;

            if cpu + allocation.cpu_units > max_cpu {
                return Ok(Admission::Deny {
                    reason: format!(
                        "cpu ceiling: {:.1} + {:.1} > {:.1}",
                        cpu, allocation.cpu_units, max_cpu
                    ),
                });
            }
            if ram + allocation.ram_units > max_ram {
                return Ok(Admission::Deny {
                    reason: format!(
                        "ram ceiling: {:.1} + {:.1} > {:.1}",
                        ram, allocation.ram_units, max_ram
                    ),
                });
            }

            conn.execute(
                "INSERT OR REPLACE INTO capacity_allocations \
                 (worker_id, kind, cpu_units, ram_units) VALUES (?1, ?2, ?3, ?4)",
                params![
                    allocation.worker_id,
                    allocation.kind,
                    allocation.cpu_units,
                    allocation.ram_units,
                ],
            )
            .map_err(|e| CapacityError::Database(e.to_string()))?;
            Ok(Admission::Admit)
        })();

        match &result {
            Ok(_) => {
                conn.execute("COMMIT", [])
                    .map_err(|e| CapacityError::Database(e.to_string()))?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }
        result
    }

    async fn release(&self, worker_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM capacity_allocations WHERE worker_id = ?1",
            params![worker_id],
        )
        .map_err(|e| CapacityError::Database(e.to_string()))?;
        Ok(())
    }

    async fn usage(&self) -> Result<(f64, f64)> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT COALESCE(SUM(cpu_units), 0), COALESCE(SUM(ram_units), 0) \
             FROM capacity_allocations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| CapacityError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(id: &str, cpu: f64, ram: f64) -> Allocation {
        Allocation {
            worker_id: id.to_string(),
            kind: "extraction".to_string(),
            cpu_units: cpu,
            ram_units: ram,
        }
    }

    #[tokio::test]
    async fn test_sqlite_allocate_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCapacityStore::new(&dir.path().join("state.db")).unwrap();

        assert_eq!(
            store
                .try_allocate(&allocation("w1", 1.0, 2.0), 2.0, 4.0)
                .await
                .unwrap(),
            Admission::Admit
        );
        assert_eq!(
            store
                .try_allocate(&allocation("w2", 1.0, 2.0), 2.0, 4.0)
                .await
                .unwrap(),
            Admission::Admit
        );
        assert!(matches!(
            store
                .try_allocate(&allocation("w3", 1.0, 2.0), 2.0, 4.0)
                .await
                .unwrap(),
            Admission::Deny { .. }
        ));

        store.release("w1").await.unwrap();
        assert_eq!(
            store
                .try_allocate(&allocation("w3", 1.0, 2.0), 2.0, 4.0)
                .await
                .unwrap(),
            Admission::Admit
        );
    }

    #[tokio::test]
    async fn test_sqlite_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let a = SqliteCapacityStore::new(&db).unwrap();
        let b = SqliteCapacityStore::new(&db).unwrap();

        a.try_allocate(&allocation("w1", 1.0, 1.0), 2.0, 2.0)
            .await
            .unwrap();
        let (cpu, _) = b.usage().await.unwrap();
        assert!((cpu - 1.0).abs() < 1e-9);
        assert!(matches!(
            b.try_allocate(&allocation("w2", 1.5, 0.5), 2.0, 2.0)
                .await
                .unwrap(),
            Admission::Deny { .. }
        ));
    }
}
