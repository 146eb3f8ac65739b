//! Supervisor: builds the shared infrastructure, admits and starts the
//! worker fleet, and coordinates shutdown.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capacity::{
    Admission, CapacityManager, ResourceProfile, SqliteCapacityStore,
};
use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::limiter::{RateLimiter, SqliteLimiterBackend};
use crate::llm::{AnthropicVision, GeminiVision, VisionModel};
use crate::models::{JobKind, WorkerRecord};
use crate::monitor::HealthMonitor;
use crate::ocr::{OcrConfig, OcrPipeline, PopplerRasterizer, StageContext};
use crate::queue::QueueGateway;
use crate::storage::BlobStore;
use crate::worker::{ExtractorRegistry, Worker};

/// Process exit codes.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_DEADLINE_ABORT: i32 = 2;

/// Hard ceiling on shutdown: workers past this are abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(90);

pub struct Supervisor {
    settings: Settings,
    extractors: Arc<ExtractorRegistry>,
}

impl Supervisor {
    pub fn new(settings: Settings, extractors: ExtractorRegistry) -> Self {
        Self {
            settings,
            extractors: Arc::new(extractors),
        }
    }

    /// Start the fleet and block until shutdown. Returns the process exit
    /// code.
    pub async fn run(self) -> anyhow::Result<i32> {
        let gateway = QueueGateway::open(&self.settings.queue_configs())?;
        let dispatcher = Dispatcher::new(gateway.clone());

        if let Some(parent) = self.settings.shared_state_db.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let capacity = CapacityManager::new(
            self.settings.capacity_limits(),
            Arc::new(SqliteCapacityStore::new(&self.settings.shared_state_db)?),
        );
        let limiter = RateLimiter::new(Arc::new(SqliteLimiterBackend::new(
            &self.settings.shared_state_db,
            &self.settings.api_limits(),
        )?));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();

        // The monitor runs alongside the fleet; a standalone deployment
        // uses the `monitor` subcommand against the same queues.
        join_set.spawn(
            HealthMonitor::new(
                gateway.clone(),
                self.settings.monitor_config(),
                shutdown_rx.clone(),
            )
            .run(),
        );

        let ocr_pipeline = self.build_ocr_pipeline(&limiter);
        let mut started = 0usize;

        // Extraction workers claim the kinds the registry can execute.
        let extraction_kinds: BTreeSet<JobKind> = self.extractors.keys().copied().collect();
        if self.settings.worker_count > 0 && extraction_kinds.is_empty() {
            warn!("no extractors registered; extraction workers will idle");
        }

        for _ in 0..self.settings.worker_count {
            started += self
                .start_worker(
                    &mut join_set,
                    WorkerPlan {
                        kinds: extraction_kinds.clone(),
                        ocr_capable: false,
                        profile: ResourceProfile::extraction(),
                        kind_label: "extraction",
                    },
                    &gateway,
                    &dispatcher,
                    &capacity,
                    None,
                    &shutdown_rx,
                )
                .await as usize;
        }

        match &ocr_pipeline {
            Some(pipeline) => {
                for _ in 0..self.settings.ocr_worker_count {
                    started += self
                        .start_worker(
                            &mut join_set,
                            WorkerPlan {
                                kinds: BTreeSet::new(),
                                ocr_capable: true,
                                profile: ResourceProfile::ocr(),
                                kind_label: "ocr",
                            },
                            &gateway,
                            &dispatcher,
                            &capacity,
                            Some(pipeline.clone()),
                            &shutdown_rx,
                        )
                        .await as usize;
                }
            }
            None if self.settings.ocr_worker_count > 0 => {
                warn!("no vision API key configured; skipping OCR workers");
            }
            None => {}
        }

        info!(
            workers = started,
            environments = self.settings.environments.len(),
            "supervisor ready"
        );

        // Forward the OS shutdown signal to every task.
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, draining workers");
        let _ = shutdown_tx.send(true);

        let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            while join_set.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            info!("clean shutdown");
            Ok(EXIT_CLEAN)
        } else {
            error!(
                "workers still draining after {:?}, aborting",
                SHUTDOWN_DEADLINE
            );
            join_set.abort_all();
            Ok(EXIT_DEADLINE_ABORT)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_worker(
        &self,
        join_set: &mut JoinSet<()>,
        plan: WorkerPlan,
        gateway: &QueueGateway,
        dispatcher: &Dispatcher,
        capacity: &CapacityManager,
        ocr: Option<Arc<OcrPipeline>>,
        shutdown: &watch::Receiver<bool>,
    ) -> bool {
        let worker_id = format!("{}-{}", plan.kind_label, Uuid::new_v4());

        match capacity.admit(&worker_id, plan.kind_label, plan.profile).await {
            Ok(Admission::Admit) => {}
            Ok(Admission::Deny { reason }) => {
                // Capacity denial is non-fatal; the rest of the fleet runs.
                warn!(worker_id = %worker_id, %reason, "worker admission denied");
                return false;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "capacity check failed");
                return false;
            }
        }

        let record = WorkerRecord::new(&worker_id, plan.kinds, plan.ocr_capable);
        let worker = Worker::new(
            record,
            gateway.clone(),
            dispatcher.clone(),
            self.extractors.clone(),
            ocr,
            capacity.clone(),
            self.settings.worker_config(),
            shutdown.clone(),
        );
        join_set.spawn(worker.run());
        true
    }

    /// Wire the OCR pipeline from the configured model credentials.
    /// Extraction runs on Gemini when available, boost prefers Anthropic,
    /// and line-count consensus needs both.
    fn build_ocr_pipeline(&self, limiter: &RateLimiter) -> Option<Arc<OcrPipeline>> {
        let gemini: Option<Arc<dyn VisionModel>> = self
            .settings
            .gemini_api_key
            .as_ref()
            .map(|key| Arc::new(GeminiVision::new(key.clone())) as Arc<dyn VisionModel>);
        let anthropic: Option<Arc<dyn VisionModel>> = self
            .settings
            .anthropic_api_key
            .as_ref()
            .map(|key| Arc::new(AnthropicVision::new(key.clone())) as Arc<dyn VisionModel>);

        let extract_model = gemini.clone().or_else(|| anthropic.clone())?;
        let boost_model = anthropic.clone().unwrap_or_else(|| extract_model.clone());
        let consensus_model = match (&gemini, &anthropic) {
            (Some(_), Some(consensus)) => Some(consensus.clone()),
            _ => None,
        };

        if !PopplerRasterizer::is_available() {
            warn!("pdftoppm not found; OCR jobs will fail until poppler-utils is installed");
        }

        Some(Arc::new(OcrPipeline::new(
            BlobStore::new(self.settings.blob_storage_dir.clone()),
            Arc::new(PopplerRasterizer::new()),
            StageContext {
                limiter: limiter.clone(),
                extract_model,
                boost_model,
                consensus_model,
            },
            OcrConfig::default(),
        )))
    }
}

struct WorkerPlan {
    kinds: BTreeSet<JobKind>,
    ocr_capable: bool,
    profile: ResourceProfile,
    kind_label: &'static str,
}
