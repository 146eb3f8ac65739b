//! Fleet capacity accounting.
//!
//! Each worker kind carries a fixed CPU/RAM profile. The manager admits a
//! worker only while the aggregate of live allocations stays under the
//! configured ceilings minus the OS reserve, first-come-first-served, no
//! preemption. Admission is per worker, never per job.

mod store;

pub use store::{CapacityStore, MemoryCapacityStore, SqliteCapacityStore};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Admission denied: {0}")]
    Denied(String),
}

pub type Result<T> = std::result::Result<T, CapacityError>;

/// Fixed resource cost of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// vCPU units.
    pub cpu_units: f64,
    /// RAM in GB.
    pub ram_units: f64,
}

impl ResourceProfile {
    /// Browser-automation extraction worker: a headless browser dominates.
    pub fn extraction() -> Self {
        Self {
            cpu_units: 1.0,
            ram_units: 2.0,
        }
    }

    /// OCR worker: rasterization spikes CPU, page images sit in RAM.
    pub fn ocr() -> Self {
        Self {
            cpu_units: 0.5,
            ram_units: 1.0,
        }
    }
}

/// One live allocation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub worker_id: String,
    pub kind: String,
    pub cpu_units: f64,
    pub ram_units: f64,
}

/// Usable ceilings after the OS reserve is withheld.
#[derive(Debug, Clone, Copy)]
pub struct CapacityLimits {
    pub max_cpu: f64,
    pub max_ram: f64,
    pub reserve_cpu_percent: f64,
    pub reserve_ram_percent: f64,
}

impl CapacityLimits {
    pub fn usable_cpu(&self) -> f64 {
        self.max_cpu * (1.0 - self.reserve_cpu_percent / 100.0)
    }

    pub fn usable_ram(&self) -> f64 {
        self.max_ram * (1.0 - self.reserve_ram_percent / 100.0)
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit,
    Deny { reason: String },
}

/// Global accountant for worker admissions.
#[derive(Clone)]
pub struct CapacityManager {
    limits: CapacityLimits,
    store: Arc<dyn CapacityStore>,
}

impl CapacityManager {
    pub fn new(limits: CapacityLimits, store: Arc<dyn CapacityStore>) -> Self {
        Self { limits, store }
    }

    /// Admit a worker if the fleet stays under the usable ceilings, and
    /// record its allocation. The check and the record are one atomic
    /// operation in the store.
    pub async fn admit(
        &self,
        worker_id: &str,
        kind: &str,
        profile: ResourceProfile,
    ) -> Result<Admission> {
        self.store
            .try_allocate(
                &Allocation {
                    worker_id: worker_id.to_string(),
                    kind: kind.to_string(),
                    cpu_units: profile.cpu_units,
                    ram_units: profile.ram_units,
                },
                self.limits.usable_cpu(),
                self.limits.usable_ram(),
            )
            .await
    }

    /// Release a worker's allocation on teardown. Releasing an unknown
    /// worker is a no-op.
    pub async fn release(&self, worker_id: &str) -> Result<()> {
        self.store.release(worker_id).await
    }

    /// Current aggregate usage (cpu, ram).
    pub async fn usage(&self) -> Result<(f64, f64)> {
        self.store.usage().await
    }

    pub fn limits(&self) -> CapacityLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> CapacityLimits {
        CapacityLimits {
            max_cpu: 4.0,
            max_ram: 8.0,
            reserve_cpu_percent: 25.0,
            reserve_ram_percent: 25.0,
        }
    }

    fn manager() -> CapacityManager {
        CapacityManager::new(limits(), Arc::new(MemoryCapacityStore::new()))
    }

    #[test]
    fn test_usable_after_reserve() {
        let limits = limits();
        assert!((limits.usable_cpu() - 3.0).abs() < 1e-9);
        assert!((limits.usable_ram() - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_admit_until_ceiling() {
        let manager = manager();
        // Usable: 3 cpu / 6 ram. Extraction profile is 1 cpu / 2 ram.
        for i in 0..3 {
            let admission = manager
                .admit(&format!("w{}", i), "extraction", ResourceProfile::extraction())
                .await
                .unwrap();
            assert_eq!(admission, Admission::Admit);
        }
        let denied = manager
            .admit("w3", "extraction", ResourceProfile::extraction())
            .await
            .unwrap();
        assert!(matches!(denied, Admission::Deny { .. }));
    }

    #[tokio::test]
    async fn test_release_frees_capacity() {
        let manager = manager();
        for i in 0..3 {
            manager
                .admit(&format!("w{}", i), "extraction", ResourceProfile::extraction())
                .await
                .unwrap();
        }
        manager.release("w0").await.unwrap();
        let admission = manager
            .admit("w3", "extraction", ResourceProfile::extraction())
            .await
            .unwrap();
        assert_eq!(admission, Admission::Admit);
    }

    #[tokio::test]
    async fn test_usage_tracks_allocations() {
        let manager = manager();
        manager
            .admit("w0", "ocr", ResourceProfile::ocr())
            .await
            .unwrap();
        let (cpu, ram) = manager.usage().await.unwrap();
        assert!((cpu - 0.5).abs() < 1e-9);
        assert!((ram - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ceiling_never_exceeded() {
        let manager = manager();
        let mut admitted = 0;
        for i in 0..20 {
            if manager
                .admit(&format!("w{}", i), "ocr", ResourceProfile::ocr())
                .await
                .unwrap()
                == Admission::Admit
            {
                admitted += 1;
            }
        }
        let (cpu, ram) = manager.usage().await.unwrap();
        assert!(cpu <= limits().usable_cpu() + 1e-9);
        assert!(ram <= limits().usable_ram() + 1e-9);
        // RAM is the binding constraint: 6 GB / 1 GB per OCR worker.
        assert_eq!(admitted, 6);
    }

    #[tokio::test]
    async fn test_release_unknown_worker_is_noop() {
        let manager = manager();
        manager.release("ghost").await.unwrap();
    }
}
