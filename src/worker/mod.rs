//! Worker runtime: the long-lived claim-execute-report loop.
//!
//! One job at a time per worker; fleet parallelism comes from running many
//! workers. The loop registers once, heartbeats on a fixed cadence, asks
//! the dispatcher for work, runs the matching executor under a hard
//! deadline, and reports the outcome through the queue gateway. A shutdown
//! signal drains the worker: the current job finishes, new jobs are
//! refused, capacity is released after the liveness row goes offline.

mod executor;

pub use executor::{ExtractionArtifact, Extractor, ExtractorError, ExtractorRegistry};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::capacity::CapacityManager;
use crate::dispatch::{Dispatcher, WorkerCapabilities};
use crate::models::{Job, JobOutcome, JobStatus, WorkerRecord, WorkerState};
use crate::ocr::OcrPipeline;
use crate::queue::{HeartbeatUpdate, QueueGateway};
use crate::utils::jittered_interval;

/// Cadence and deadline knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Heartbeat cadence while polling.
    pub idle_heartbeat: Duration,
    /// Heartbeat cadence while a job is running.
    pub busy_heartbeat: Duration,
    /// Hard deadline for one extraction job.
    pub extraction_deadline: Duration,
    /// Hard deadline for one OCR job.
    pub ocr_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            idle_heartbeat: Duration::from_secs(15),
            busy_heartbeat: Duration::from_secs(60),
            extraction_deadline: Duration::from_secs(10 * 60),
            ocr_deadline: Duration::from_secs(15 * 60),
        }
    }
}

pub struct Worker {
    record: WorkerRecord,
    gateway: QueueGateway,
    dispatcher: Dispatcher,
    extractors: Arc<ExtractorRegistry>,
    ocr: Option<Arc<OcrPipeline>>,
    capacity: CapacityManager,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record: WorkerRecord,
        gateway: QueueGateway,
        dispatcher: Dispatcher,
        extractors: Arc<ExtractorRegistry>,
        ocr: Option<Arc<OcrPipeline>>,
        capacity: CapacityManager,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            record,
            gateway,
            dispatcher,
            extractors,
            ocr,
            capacity,
            config,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            worker_id: self.record.id.clone(),
            kinds: self.record.kind_capabilities.clone(),
            ocr_capable: self.record.ocr_capable,
        }
    }

    /// Main loop. Returns once drained after a shutdown signal.
    pub async fn run(mut self) {
        self.register();
        info!(worker_id = %self.record.id, ocr = self.record.ocr_capable, "worker started");

        let capabilities = self.capabilities();
        let mut last_idle_beat: Option<std::time::Instant> = None;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let job = match self.dispatcher.pick_job(&capabilities) {
                Ok(job) => job,
                Err(e) => {
                    // Infrastructure error: keep polling, the store may heal.
                    error!(worker_id = %self.record.id, error = %e, "poll failed");
                    None
                }
            };

            match job {
                None => {
                    // Idle heartbeats follow their own cadence, not the
                    // poll cadence.
                    let due = last_idle_beat
                        .map_or(true, |at| at.elapsed() >= self.config.idle_heartbeat);
                    if due {
                        self.heartbeat(WorkerState::Idle, None);
                        last_idle_beat = Some(std::time::Instant::now());
                    }
                    let nap = jittered_interval(self.config.poll_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Some(job) => {
                    self.heartbeat(WorkerState::Busy, Some(&job.id));
                    self.execute_and_report(&job).await;
                    self.heartbeat(WorkerState::Idle, None);
                    last_idle_beat = Some(std::time::Instant::now());
                }
            }
        }

        self.heartbeat(WorkerState::Draining, None);
        self.mark_offline();
        if let Err(e) = self.capacity.release(&self.record.id).await {
            warn!(worker_id = %self.record.id, error = %e, "capacity release failed");
        }
        info!(worker_id = %self.record.id, "worker offline");
    }

    /// Run one claimed job under its deadline, heartbeating while it runs,
    /// and report the outcome.
    async fn execute_and_report(&mut self, job: &Job) {
        let is_ocr = job.status == JobStatus::OcrProcessing;
        let deadline = if is_ocr {
            self.config.ocr_deadline
        } else {
            self.config.extraction_deadline
        };

        let result = {
            let work = self.execute(job, is_ocr);
            tokio::pin!(work);

            let mut ticker = tokio::time::interval(self.config.busy_heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick

            let hard_stop = tokio::time::sleep(deadline);
            tokio::pin!(hard_stop);

            loop {
                tokio::select! {
                    result = &mut work => break Some(result),
                    _ = &mut hard_stop => break None,
                    _ = ticker.tick() => {
                        // A worker mid-call may miss a tick and catch up here.
                        let state = if *self.shutdown.borrow() {
                            WorkerState::Draining
                        } else {
                            WorkerState::Busy
                        };
                        self.heartbeat(state, Some(&job.id));
                    }
                }
            }
        };

        match result {
            Some(Ok(outcome)) => {
                self.record.jobs_completed += 1;
                self.report_write(job, is_ocr, || {
                    self.gateway
                        .repository(&job.environment)?
                        .report_success(&job.id, &outcome)
                });
            }
            Some(Err(failure)) => {
                self.record.jobs_failed += 1;
                warn!(
                    worker_id = %self.record.id,
                    job_id = %job.id,
                    retryable = failure.retryable,
                    "job failed: {}",
                    failure.message
                );
                self.report_write(job, is_ocr, || {
                    let repo = self.gateway.repository(&job.environment)?;
                    if is_ocr {
                        repo.report_ocr_failure(&job.id, &failure.message, failure.retryable)
                    } else {
                        repo.report_failure(&job.id, &failure.message, failure.retryable)
                    }
                });
            }
            None => {
                // Deadline exceeded. The in-flight call is abandoned, not
                // cancelled at the wire; its eventual result is discarded.
                self.record.jobs_failed += 1;
                let message = format!("deadline exceeded after {:?}", deadline);
                warn!(worker_id = %self.record.id, job_id = %job.id, "{}", message);
                self.report_write(job, is_ocr, || {
                    let repo = self.gateway.repository(&job.environment)?;
                    if is_ocr {
                        repo.report_ocr_failure(&job.id, &message, true)
                    } else {
                        repo.report_failure(&job.id, &message, true)
                    }
                });
            }
        }
    }

    async fn execute(&self, job: &Job, is_ocr: bool) -> Result<JobOutcome, JobFailure> {
        if is_ocr {
            let pipeline = self.ocr.as_ref().ok_or_else(|| JobFailure {
                message: "worker claimed an OCR job without a pipeline".to_string(),
                retryable: false,
            })?;
            let outcome = pipeline.process(job).await.map_err(|e| JobFailure {
                message: e.to_string(),
                retryable: e.is_retryable(),
            })?;
            let warning = outcome.warning();
            Ok(JobOutcome::Ocr {
                raw_text: outcome.raw_text,
                boosted_text: outcome.boosted_text,
                warning,
            })
        } else {
            let extractor = self.extractors.get(&job.kind).ok_or_else(|| JobFailure {
                // Claim filters on our capability set, so this is a wiring
                // bug, not a transient condition.
                message: format!("no executor registered for kind {}", job.kind.as_str()),
                retryable: false,
            })?;
            let artifact = extractor.run(job).await.map_err(|e| JobFailure {
                message: e.to_string(),
                retryable: e.retryable,
            })?;
            Ok(JobOutcome::Extracted {
                artifact_path: artifact.artifact_path,
            })
        }
    }

    /// Apply a queue write, logging instead of crashing on persistent
    /// failure; the next successful write carries the state forward.
    fn report_write<F>(&self, job: &Job, is_ocr: bool, write: F)
    where
        F: Fn() -> crate::queue::Result<()>,
    {
        if let Err(e) = crate::queue::with_retry(|| write()) {
            error!(
                worker_id = %self.record.id,
                job_id = %job.id,
                ocr = is_ocr,
                error = %e,
                "report write failed; job will be reclaimed by the monitor"
            );
        }
    }

    fn register(&self) {
        for (env, repo) in self.gateway.repositories() {
            if let Err(e) = repo.register_worker(&self.record) {
                warn!(
                    worker_id = %self.record.id,
                    environment = %env.name,
                    error = %e,
                    "worker registration failed"
                );
            }
        }
    }

    /// Upsert liveness in every environment this worker serves. A failed
    /// heartbeat risks eviction; it is logged and retried on the next tick.
    fn heartbeat(&self, status: WorkerState, current_job_id: Option<&str>) {
        let update = HeartbeatUpdate {
            worker_id: self.record.id.clone(),
            status,
            current_job_id: current_job_id.map(|s| s.to_string()),
            jobs_completed: self.record.jobs_completed,
            jobs_failed: self.record.jobs_failed,
        };
        for (env, repo) in self.gateway.repositories() {
            if let Err(e) = repo.heartbeat(&update) {
                warn!(
                    worker_id = %self.record.id,
                    environment = %env.name,
                    error = %e,
                    "heartbeat failed"
                );
            }
        }
    }

    fn mark_offline(&self) {
        for (env, repo) in self.gateway.repositories() {
            if let Err(e) = repo.mark_worker_offline(&self.record.id) {
                warn!(
                    worker_id = %self.record.id,
                    environment = %env.name,
                    error = %e,
                    "offline transition failed"
                );
            }
        }
    }
}

/// Internal failure carrying the retry classification to the report step.
struct JobFailure {
    message: String,
    retryable: bool,
}
