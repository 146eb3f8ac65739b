//! Queue selection policy.
//!
//! The dispatcher decides which environment a worker polls next and in
//! what order, then delegates the actual claim to the queue gateway. A
//! shared cursor rotates the starting environment across polls so no
//! environment is starved.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::models::{Job, JobKind};
use crate::queue::{QueueGateway, Result};

/// What the dispatcher needs to know about the asking worker.
#[derive(Debug, Clone)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    pub kinds: BTreeSet<JobKind>,
    pub ocr_capable: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    gateway: QueueGateway,
    cursor: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(gateway: QueueGateway) -> Self {
        Self {
            gateway,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Claim the next job for this worker, or `None` when every eligible
    /// queue is empty.
    ///
    /// Environments are visited in round-robin order from the persisted
    /// cursor. Within one environment, OCR claims come first for
    /// OCR-capable workers: OCR jobs only exist after a successful
    /// extraction and accumulate quickly behind their SLA. The
    /// per-environment OCR enable flag is honored.
    pub fn pick_job(&self, worker: &WorkerCapabilities) -> Result<Option<Job>> {
        let environments = self.gateway.list_environments();
        if environments.is_empty() {
            return Ok(None);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % environments.len();

        for offset in 0..environments.len() {
            let environment = &environments[(start + offset) % environments.len()];
            let repo = self.gateway.repository(&environment.name)?;

            if worker.ocr_capable && environment.ocr_enabled {
                if let Some(job) = repo.claim_next_ocr(&worker.worker_id)? {
                    return Ok(Some(job));
                }
            }

            if !worker.kinds.is_empty() {
                if let Some(job) = repo.claim_next(&worker.kinds, &worker.worker_id)? {
                    return Ok(Some(job));
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, SourceDescriptor};

    fn gateway(envs: &[(&str, bool)]) -> (tempfile::TempDir, QueueGateway) {
        let dir = tempfile::tempdir().unwrap();
        let configs: Vec<(String, std::path::PathBuf, bool)> = envs
            .iter()
            .map(|(name, ocr)| {
                (
                    name.to_string(),
                    dir.path().join(format!("{}.db", name)),
                    *ocr,
                )
            })
            .collect();
        let gateway = QueueGateway::open(&configs).unwrap();
        (dir, gateway)
    }

    fn insert(gateway: &QueueGateway, env: &str, id: &str, kind: JobKind, status: JobStatus) {
        let mut job = Job::new(id, env, kind, SourceDescriptor::new("t", id));
        job.status = status;
        gateway.repository(env).unwrap().insert_job(&job).unwrap();
    }

    fn extraction_worker(id: &str) -> WorkerCapabilities {
        WorkerCapabilities {
            worker_id: id.to_string(),
            kinds: JobKind::all().into_iter().collect(),
            ocr_capable: false,
        }
    }

    fn ocr_worker(id: &str) -> WorkerCapabilities {
        WorkerCapabilities {
            worker_id: id.to_string(),
            kinds: BTreeSet::new(),
            ocr_capable: true,
        }
    }

    #[test]
    fn test_picks_from_any_environment() {
        let (_dir, gateway) = gateway(&[("dev", false), ("prod", false)]);
        insert(&gateway, "prod", "j1", JobKind::Extraction, JobStatus::Pending);

        let dispatcher = Dispatcher::new(gateway);
        let job = dispatcher
            .pick_job(&extraction_worker("w1"))
            .unwrap()
            .unwrap();
        assert_eq!(job.id, "j1");
        assert_eq!(job.environment, "prod");
    }

    #[test]
    fn test_round_robin_rotates_start() {
        let (_dir, gateway) = gateway(&[("dev", false), ("prod", false)]);
        insert(&gateway, "dev", "d1", JobKind::Extraction, JobStatus::Pending);
        insert(&gateway, "dev", "d2", JobKind::Extraction, JobStatus::Pending);
        insert(&gateway, "prod", "p1", JobKind::Extraction, JobStatus::Pending);
        insert(&gateway, "prod", "p2", JobKind::Extraction, JobStatus::Pending);

        let dispatcher = Dispatcher::new(gateway);
        let worker = extraction_worker("w1");
        let environments: Vec<String> = (0..4)
            .map(|_| dispatcher.pick_job(&worker).unwrap().unwrap().environment)
            .collect();

        // Alternating starts drain both queues instead of one.
        assert_eq!(
            environments,
            vec!["dev", "prod", "dev", "prod"]
        );
    }

    #[test]
    fn test_ocr_preferred_over_extraction() {
        let (_dir, gateway) = gateway(&[("dev", true)]);
        insert(&gateway, "dev", "pending", JobKind::OcrIndex, JobStatus::Pending);
        insert(
            &gateway,
            "dev",
            "ready",
            JobKind::OcrIndex,
            JobStatus::ExtractionDone,
        );

        let dispatcher = Dispatcher::new(gateway);
        let worker = WorkerCapabilities {
            worker_id: "w1".to_string(),
            kinds: JobKind::all().into_iter().collect(),
            ocr_capable: true,
        };
        let job = dispatcher.pick_job(&worker).unwrap().unwrap();
        assert_eq!(job.id, "ready");
        assert_eq!(job.status, JobStatus::OcrProcessing);
    }

    #[test]
    fn test_ocr_enable_flag_honored() {
        let (_dir, gateway) = gateway(&[("prod", false)]);
        insert(
            &gateway,
            "prod",
            "ready",
            JobKind::OcrIndex,
            JobStatus::ExtractionDone,
        );

        let dispatcher = Dispatcher::new(gateway);
        assert!(dispatcher.pick_job(&ocr_worker("w1")).unwrap().is_none());
    }

    #[test]
    fn test_empty_queues_return_none() {
        let (_dir, gateway) = gateway(&[("dev", true)]);
        let dispatcher = Dispatcher::new(gateway);
        assert!(dispatcher
            .pick_job(&extraction_worker("w1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_ocr_worker_ignores_pending_extractions() {
        let (_dir, gateway) = gateway(&[("dev", true)]);
        insert(&gateway, "dev", "j1", JobKind::Extraction, JobStatus::Pending);

        let dispatcher = Dispatcher::new(gateway);
        assert!(dispatcher.pick_job(&ocr_worker("w1")).unwrap().is_none());
    }
}
