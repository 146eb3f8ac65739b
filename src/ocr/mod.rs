//! OCR pipeline: PDF artifact to merged transcripts.
//!
//! Stages run as a fixed DAG: fetch, rasterize, upscale, then per-page
//! line-count, extract, and boost under the bounded parallel map, then a
//! pure merge. Page results live in arrays indexed by page number, so
//! completion order never reorders output.

mod image_prep;
mod merge;
mod parallel;
mod raster;
mod stages;
mod types;

pub use image_prep::{choose_payload, raw_threshold, upscale_png, ImagePayload, UPSCALE_FACTOR};
pub use merge::merge_pages;
pub use parallel::{bounded_parallel_map, StageConfig, StageFailure, StageOutcome};
pub use raster::{PageRasterizer, PopplerRasterizer};
pub use stages::{
    boost_page, extract_page, line_count_page, parse_line_count, StageContext, BOOST_TIMEOUT,
    EXTRACT_TIMEOUT, LINE_COUNT_TIMEOUT,
};
pub use types::{OcrOutcome, PageImage, PageText, PipelineError};

use std::sync::Arc;

use tracing::{info, warn};

use crate::models::Job;
use crate::storage::BlobStore;

/// Pipeline policy knobs.
#[derive(Clone)]
pub struct OcrConfig {
    pub line_count_stage: StageConfig,
    pub extract_stage: StageConfig,
    pub boost_stage: StageConfig,
    /// Fail the document when any page fails, instead of emitting
    /// placeholders. Off by default.
    pub require_all_pages: bool,
    pub upscale_factor: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            line_count_stage: StageConfig::line_count(),
            extract_stage: StageConfig::extract(),
            boost_stage: StageConfig::boost(),
            require_all_pages: false,
            upscale_factor: UPSCALE_FACTOR,
        }
    }
}

/// The OCR executor handed to OCR-capable workers.
pub struct OcrPipeline {
    blob: BlobStore,
    rasterizer: Arc<dyn PageRasterizer>,
    ctx: StageContext,
    config: OcrConfig,
}

impl OcrPipeline {
    pub fn new(
        blob: BlobStore,
        rasterizer: Arc<dyn PageRasterizer>,
        ctx: StageContext,
        config: OcrConfig,
    ) -> Self {
        Self {
            blob,
            rasterizer,
            ctx,
            config,
        }
    }

    /// Run the full pipeline for one claimed OCR job.
    pub async fn process(&self, job: &Job) -> Result<OcrOutcome, PipelineError> {
        let artifact_path = job.artifact_path.as_deref().ok_or_else(|| {
            PipelineError::Rasterize(format!("job {} has no artifact path", job.id))
        })?;

        let pdf_bytes = self.blob.read(artifact_path)?;
        let pngs = self.rasterizer.rasterize(&pdf_bytes).await?;
        let pages = Arc::new(self.prepare_pages(pngs).await?);
        info!(job_id = %job.id, pages = pages.len(), "starting page stages");

        let counts = self.run_line_counts(&pages).await;
        let extractions = self.run_extract(&pages, &counts).await;

        if self.config.require_all_pages && !extractions.failures.is_empty() {
            return Err(PipelineError::PagesFailed {
                pages: extractions.failures.iter().map(|f| f.index + 1).collect(),
            });
        }
        if extractions.success_count() == 0 && !pages.is_empty() {
            return Err(PipelineError::AllPagesFailed {
                failed: extractions.failures.len(),
            });
        }

        let boosts = self.run_boost(&pages, &extractions).await;

        let mut page_errors: Vec<(usize, String)> = extractions
            .failures
            .iter()
            .map(|f| (f.index + 1, f.error.clone()))
            .collect();

        let mut page_texts = Vec::with_capacity(pages.len());
        for index in 0..pages.len() {
            let raw = extractions.results[index].clone().unwrap_or_default();
            // A failed boost falls back to the raw transcript.
            let boosted = match &boosts.results[index] {
                Some(text) => text.clone(),
                None => {
                    if let Some(failure) = boosts.failures.iter().find(|f| f.index == index) {
                        warn!(page = index + 1, error = %failure.error, "boost failed, keeping raw text");
                        page_errors.push((index + 1, format!("boost: {}", failure.error)));
                    }
                    raw.clone()
                }
            };
            page_texts.push(PageText { raw, boosted });
        }
        page_errors.sort_by_key(|(page, _)| *page);

        let (raw_text, boosted_text) = merge_pages(&page_texts);
        Ok(OcrOutcome {
            raw_text,
            boosted_text,
            page_errors,
        })
    }

    /// Decode and upscale every page off the async workers. A page whose
    /// upscale fails keeps its original as the retained copy.
    async fn prepare_pages(&self, pngs: Vec<Vec<u8>>) -> Result<Vec<PageImage>, PipelineError> {
        let factor = self.config.upscale_factor;
        tokio::task::spawn_blocking(move || {
            let mut pages = Vec::with_capacity(pngs.len());
            for (index, original_png) in pngs.into_iter().enumerate() {
                let upscaled_png = match upscale_png(&original_png, factor) {
                    Ok(upscaled) => upscaled,
                    Err(e) => {
                        warn!(page = index + 1, error = %e, "upscale failed, keeping original");
                        original_png.clone()
                    }
                };
                pages.push(PageImage {
                    index,
                    original_png,
                    upscaled_png,
                });
            }
            Ok(pages)
        })
        .await
        .map_err(|e| PipelineError::Image(format!("upscale task failed: {}", e)))?
    }

    async fn run_line_counts(&self, pages: &Arc<Vec<PageImage>>) -> StageOutcome<u32> {
        let ctx = self.ctx.clone();
        let pages = pages.clone();
        bounded_parallel_map(
            (0..pages.len()).collect(),
            &self.config.line_count_stage,
            move |index: Arc<usize>| {
                let ctx = ctx.clone();
                let pages = pages.clone();
                async move {
                    line_count_page(
                        &ctx.limiter,
                        ctx.extract_model.as_ref(),
                        ctx.consensus_model.as_deref(),
                        &pages[*index],
                    )
                    .await
                }
            },
        )
        .await
    }

    async fn run_extract(
        &self,
        pages: &Arc<Vec<PageImage>>,
        counts: &StageOutcome<u32>,
    ) -> StageOutcome<String> {
        let items: Vec<(usize, Option<u32>)> = (0..pages.len())
            .map(|index| (index, counts.results[index]))
            .collect();

        let ctx = self.ctx.clone();
        let pages = pages.clone();
        bounded_parallel_map(
            items,
            &self.config.extract_stage,
            move |item: Arc<(usize, Option<u32>)>| {
                let ctx = ctx.clone();
                let pages = pages.clone();
                async move {
                    let (index, expected_rows) = *item;
                    extract_page(
                        &ctx.limiter,
                        ctx.extract_model.as_ref(),
                        &pages[index],
                        expected_rows,
                    )
                    .await
                }
            },
        )
        .await
    }

    /// Boost every successfully extracted page. Slots for failed
    /// extractions stay `None` so the assembly step leaves them empty.
    async fn run_boost(
        &self,
        pages: &Arc<Vec<PageImage>>,
        extractions: &StageOutcome<String>,
    ) -> StageOutcome<String> {
        let items: Vec<(usize, Option<String>)> = (0..pages.len())
            .map(|index| (index, extractions.results[index].clone()))
            .collect();

        let ctx = self.ctx.clone();
        let pages = pages.clone();
        bounded_parallel_map(
            items,
            &self.config.boost_stage,
            move |item: Arc<(usize, Option<String>)>| {
                let ctx = ctx.clone();
                let pages = pages.clone();
                async move {
                    let (index, raw) = (*item).clone();
                    match raw {
                        Some(raw) => {
                            boost_page(&ctx.limiter, ctx.boost_model.as_ref(), &pages[index], &raw)
                                .await
                        }
                        // Nothing to refine; propagate the empty page.
                        None => Ok(String::new()),
                    }
                }
            },
        )
        .await
    }
}
