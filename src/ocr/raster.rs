//! PDF rasterization via Poppler.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use tracing::debug;

use super::types::PipelineError;

/// Rendering resolution in DPI. PDF points render at 72 DPI, so 288 is a
/// 4x viewport scale with fonts embedded by Poppler.
const DEFAULT_RESOLUTION: u32 = 288;

/// Turns a PDF into per-page PNGs, in page order.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(&self, pdf_bytes: &[u8]) -> Result<Vec<Vec<u8>>, PipelineError>;
}

/// Rasterizer backed by the `pdftoppm` binary (poppler-utils).
pub struct PopplerRasterizer {
    resolution: u32,
}

impl PopplerRasterizer {
    pub fn new() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
        }
    }

    pub fn with_resolution(resolution: u32) -> Self {
        Self { resolution }
    }

    /// Check that pdftoppm is installed.
    pub fn is_available() -> bool {
        which::which("pdftoppm").is_ok()
    }

    fn run_pdftoppm(pdf_path: &Path, output_dir: &Path, resolution: u32) -> Result<(), PipelineError> {
        let output_prefix = output_dir.join("page");
        let output = Command::new("pdftoppm")
            .args(["-png", "-r", &resolution.to_string()])
            .arg(pdf_path)
            .arg(&output_prefix)
            .output();

        match output {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(PipelineError::Rasterize(format!(
                    "pdftoppm failed: {}",
                    stderr.trim()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::Rasterize(
                "pdftoppm not found (install poppler-utils)".to_string(),
            )),
            Err(e) => Err(PipelineError::Rasterize(e.to_string())),
        }
    }

    /// Collect page images in order. pdftoppm names files page-1.png or
    /// page-01.png depending on page count, so sort on the numeric suffix.
    fn collect_pages(output_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let mut pages: Vec<(u32, PathBuf)> = std::fs::read_dir(output_dir)
            .map_err(|e| PipelineError::Rasterize(e.to_string()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let name = path.file_stem()?.to_str()?;
                let number: u32 = name.strip_prefix("page-")?.parse().ok()?;
                Some((number, path))
            })
            .collect();
        pages.sort_by_key(|(number, _)| *number);
        Ok(pages.into_iter().map(|(_, path)| path).collect())
    }
}

impl Default for PopplerRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageRasterizer for PopplerRasterizer {
    async fn rasterize(&self, pdf_bytes: &[u8]) -> Result<Vec<Vec<u8>>, PipelineError> {
        let pdf_bytes = pdf_bytes.to_vec();
        let resolution = self.resolution;

        // pdftoppm is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let temp_dir = tempfile::TempDir::new()
                .map_err(|e| PipelineError::Rasterize(e.to_string()))?;
            let pdf_path = temp_dir.path().join("document.pdf");
            std::fs::write(&pdf_path, &pdf_bytes)
                .map_err(|e| PipelineError::Rasterize(e.to_string()))?;

            Self::run_pdftoppm(&pdf_path, temp_dir.path(), resolution)?;

            let page_paths = Self::collect_pages(temp_dir.path())?;
            if page_paths.is_empty() {
                return Err(PipelineError::Rasterize(
                    "pdftoppm produced no pages".to_string(),
                ));
            }
            debug!(pages = page_paths.len(), "rasterized document");

            page_paths
                .iter()
                .map(|path| {
                    std::fs::read(path).map_err(|e| PipelineError::Rasterize(e.to_string()))
                })
                .collect()
        })
        .await
        .map_err(|e| PipelineError::Rasterize(format!("rasterize task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_pages_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        // Unpadded names sort wrong lexicographically; 10 must follow 9.
        for n in [10, 2, 1, 9] {
            std::fs::write(dir.path().join(format!("page-{}.png", n)), b"png").unwrap();
        }
        std::fs::write(dir.path().join("document.pdf"), b"pdf").unwrap();

        let pages = PopplerRasterizer::collect_pages(dir.path()).unwrap();
        let names: Vec<String> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["page-1.png", "page-2.png", "page-9.png", "page-10.png"]);
    }

    #[test]
    fn test_collect_pages_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["01", "02", "03"] {
            std::fs::write(dir.path().join(format!("page-{}.png", n)), b"png").unwrap();
        }
        let pages = PopplerRasterizer::collect_pages(dir.path()).unwrap();
        assert_eq!(pages.len(), 3);
    }
}
