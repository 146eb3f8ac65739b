//! Health monitor: stalled-job reclamation and dead-worker eviction.
//!
//! A separate long-lived loop over every environment. This is the only
//! component that moves a job out of a processing state without having
//! claimed it; the queue layer records the monitor as the author of each
//! such move.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::queue::{QueueGateway, QueueStats};

/// Monitor cadence and thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Repair pass cadence.
    pub tick_interval: Duration,
    /// Age past which a processing job counts as stalled.
    pub stale_job_threshold: Duration,
    /// Heartbeat silence past which a worker counts as dead.
    pub dead_worker_threshold: Duration,
    /// Ticks between aggregate snapshots (~5 minutes at the default tick).
    pub snapshot_every_ticks: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            stale_job_threshold: Duration::from_secs(180),
            dead_worker_threshold: Duration::from_secs(120),
            snapshot_every_ticks: 10,
        }
    }
}

pub struct HealthMonitor {
    gateway: QueueGateway,
    config: MonitorConfig,
    shutdown: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(gateway: QueueGateway, config: MonitorConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            gateway,
            config,
            shutdown,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "health monitor started"
        );
        let mut ticks = 0u32;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.repair_pass();

            ticks += 1;
            if ticks % self.config.snapshot_every_ticks.max(1) == 0 {
                self.snapshot_pass();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("health monitor stopped");
    }

    /// One reclamation sweep across every environment.
    pub fn repair_pass(&self) {
        let stale = chrono::Duration::from_std(self.config.stale_job_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(180));
        let dead = chrono::Duration::from_std(self.config.dead_worker_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        for (env, repo) in self.gateway.repositories() {
            match repo.reset_stalled(stale) {
                Ok(0) => {}
                Ok(count) => warn!(
                    environment = %env.name,
                    count,
                    "reclaimed stalled jobs"
                ),
                Err(e) => error!(environment = %env.name, error = %e, "reset_stalled failed"),
            }

            match repo.evict_dead_workers(dead) {
                Ok(0) => {}
                Ok(count) => warn!(
                    environment = %env.name,
                    count,
                    "evicted dead workers"
                ),
                Err(e) => error!(environment = %env.name, error = %e, "evict_dead_workers failed"),
            }
        }
    }

    /// Log the aggregate health snapshot and raise anomaly alerts.
    fn snapshot_pass(&self) {
        let dead = chrono::Duration::from_std(self.config.dead_worker_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        for (env, repo) in self.gateway.repositories() {
            let stats = match repo.stats(dead) {
                Ok(stats) => stats,
                Err(e) => {
                    error!(environment = %env.name, error = %e, "stats query failed");
                    continue;
                }
            };

            info!(
                environment = %env.name,
                active_workers = stats.active_workers,
                pending = stats.pending,
                processing = stats.processing,
                extraction_done = stats.extraction_done,
                ocr_processing = stats.ocr_processing,
                ocr_done = stats.ocr_done,
                errors = stats.error,
                "queue health snapshot"
            );

            for alert in anomalies(&stats) {
                warn!(environment = %env.name, "{}", alert);
            }
        }
    }
}

/// Anomaly rules over one environment's snapshot.
fn anomalies(stats: &QueueStats) -> Vec<String> {
    let mut alerts = Vec::new();
    if stats.active_workers == 0 && stats.pending > 0 {
        alerts.push(format!(
            "no active workers while {} jobs are pending",
            stats.pending
        ));
    }
    if stats.in_flight() > 2 * stats.active_workers {
        alerts.push(format!(
            "{} jobs in processing for {} active workers",
            stats.in_flight(),
            stats.active_workers
        ));
    }
    if stats.error > 10 {
        alerts.push(format!("{} jobs in error state", stats.error));
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> QueueStats {
        QueueStats::default()
    }

    #[test]
    fn test_no_anomalies_when_healthy() {
        let mut s = stats();
        s.active_workers = 2;
        s.pending = 5;
        s.processing = 2;
        assert!(anomalies(&s).is_empty());
    }

    #[test]
    fn test_alert_pending_without_workers() {
        let mut s = stats();
        s.pending = 3;
        let alerts = anomalies(&s);
        assert!(alerts.iter().any(|a| a.contains("no active workers")));
    }

    #[test]
    fn test_alert_processing_exceeds_workers() {
        let mut s = stats();
        s.active_workers = 1;
        s.processing = 2;
        s.ocr_processing = 1;
        let alerts = anomalies(&s);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("3 jobs in processing"));
    }

    #[test]
    fn test_alert_error_jobs() {
        let mut s = stats();
        s.active_workers = 1;
        s.error = 11;
        let alerts = anomalies(&s);
        assert!(alerts.iter().any(|a| a.contains("11 jobs in error")));
    }

    #[test]
    fn test_error_threshold_is_exclusive() {
        let mut s = stats();
        s.active_workers = 1;
        s.error = 10;
        assert!(anomalies(&s).is_empty());
    }
}
