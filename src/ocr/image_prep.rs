//! Page image preparation: upscaling and size adaptation.

use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder};
use tracing::warn;

use super::types::{PageImage, PipelineError};

/// Upscale factor applied after rasterization.
pub const UPSCALE_FACTOR: u32 = 2;

/// Payload picked for one model call.
pub enum ImagePayload<'a> {
    /// The rasterized page as-is.
    Original(&'a [u8]),
    /// The upscaled page, reduced to fit the size limit.
    Downscaled(Vec<u8>),
}

impl ImagePayload<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Original(bytes) => bytes,
            Self::Downscaled(bytes) => bytes,
        }
    }
}

fn decode(png: &[u8]) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(png).map_err(|e| PipelineError::Image(e.to_string()))
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(
            img.as_bytes(),
            img.width(),
            img.height(),
            img.color().into(),
        )
        .map_err(|e| PipelineError::Image(e.to_string()))?;
    Ok(out)
}

/// Enlarge a rasterized page with a Lanczos3 kernel.
pub fn upscale_png(png: &[u8], factor: u32) -> Result<Vec<u8>, PipelineError> {
    let img = decode(png)?;
    let resized = img.resize_exact(
        img.width() * factor,
        img.height() * factor,
        FilterType::Lanczos3,
    );
    encode_png(&resized)
}

/// Raw-byte threshold for a model call given the model's hard image cap.
///
/// Base64 inflates payloads by 4/3, and the request carries prompt and
/// envelope on top, so stay at 3/5 of the cap (3 MB for a 5 MB limit).
pub fn raw_threshold(max_image_bytes: usize) -> usize {
    max_image_bytes * 3 / 5
}

/// Choose what to send for one page.
///
/// The original rasterization goes out when it fits. When it does not, the
/// retained upscale is reduced to fit; if no reduction lands under the
/// threshold the original goes out anyway, with a warning, and the model's
/// own limit decides.
pub fn choose_payload(page: &PageImage, max_raw_bytes: usize) -> ImagePayload<'_> {
    if page.original_png.len() <= max_raw_bytes {
        return ImagePayload::Original(&page.original_png);
    }

    match downscale_to_fit(&page.upscaled_png, max_raw_bytes) {
        Ok(Some(reduced)) => ImagePayload::Downscaled(reduced),
        Ok(None) | Err(_) => {
            warn!(
                page = page.index + 1,
                bytes = page.original_png.len(),
                limit = max_raw_bytes,
                "page image exceeds size limit even after downscaling, sending original"
            );
            ImagePayload::Original(&page.original_png)
        }
    }
}

/// Shrink an image until its PNG encoding fits `max_bytes`. Gives up after
/// a few halvings rather than degrading into an unreadable thumbnail.
fn downscale_to_fit(png: &[u8], max_bytes: usize) -> Result<Option<Vec<u8>>, PipelineError> {
    if png.len() <= max_bytes {
        return Ok(Some(png.to_vec()));
    }

    let mut img = decode(png)?;
    for _ in 0..4 {
        let scale = ((max_bytes as f64 / png.len() as f64).sqrt() * 0.95).min(0.9);
        let width = ((img.width() as f64) * scale).max(1.0) as u32;
        let height = ((img.height() as f64) * scale).max(1.0) as u32;
        img = img.resize_exact(width, height, FilterType::Lanczos3);

        let encoded = encode_png(&img)?;
        if encoded.len() <= max_bytes {
            return Ok(Some(encoded));
        }
    }
    Ok(None)
}
