//! Document rasterisation: turn an input file into one image per page.
//!
//! PDFs are rendered through pdfium at the configured density. Raster
//! inputs (PNG/JPEG scans) are decoded as a single page, which is how phone
//! photos of a bill end up in the same pipeline as e-bills.
//!
//! Everything here is blocking and CPU-bound; the runner calls it through
//! `tokio::task::spawn_blocking`.

use crate::error::DocumentError;
use crate::model::PageImage;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Points per inch in PDF user space.
const PDF_POINTS_PER_INCH: f32 = 72.0;

/// Rendering parameters taken from the pipeline config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
}

/// Produces page images from document bytes.
///
/// Implementations must be deterministic: the same bytes and options give
/// the same page count and pixel dimensions.
pub trait PageRenderer: Send + Sync {
    fn render(&self, bytes: &[u8], options: &RenderOptions) -> Result<Vec<PageImage>, DocumentError>;
}

/// Default renderer: pdfium for PDFs, the `image` crate for scans.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentRenderer;

impl PageRenderer for DocumentRenderer {
    fn render(&self, bytes: &[u8], options: &RenderOptions) -> Result<Vec<PageImage>, DocumentError> {
        if bytes.starts_with(b"%PDF") {
            return render_pdf(bytes, options);
        }
        if image::guess_format(bytes).is_ok() {
            return render_raster(bytes, options);
        }

        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        Err(DocumentError::UnreadableDocument {
            detail: format!("not a PDF or supported image (first bytes: {:?})", magic),
        })
    }
}

/// Read `path` and render it with [`DocumentRenderer`].
pub fn render_document(path: &Path, options: &RenderOptions) -> Result<Vec<PageImage>, DocumentError> {
    let bytes = std::fs::read(path).map_err(|e| DocumentError::Io {
        detail: format!("cannot read '{}': {}", path.display(), e),
    })?;
    DocumentRenderer.render(&bytes, options)
}

/// Rasterise every page of a PDF.
fn render_pdf(bytes: &[u8], options: &RenderOptions) -> Result<Vec<PageImage>, DocumentError> {
    let pdfium = pdfium_auto::bind_pdfium_silent().map_err(|e| {
        DocumentError::RenderingUnavailable {
            detail: e.to_string(),
        }
    })?;

    let document = pdfium.load_pdf_from_byte_slice(bytes, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        let detail = if err_str.contains("Password") || err_str.contains("password") {
            "PDF is encrypted and requires a password".to_string()
        } else {
            format!("corrupt PDF: {}", err_str)
        };
        DocumentError::UnreadableDocument { detail }
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages == 0 {
        return Err(DocumentError::UnreadableDocument {
            detail: "PDF has no pages".into(),
        });
    }
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(options.dpi as f32 / PDF_POINTS_PER_INCH)
        .set_maximum_width(options.max_rendered_pixels as i32)
        .set_maximum_height(options.max_rendered_pixels as i32);

    let mut results = Vec::with_capacity(total_pages);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            DocumentError::UnreadableDocument {
                detail: format!("page {} failed to render: {:?}", idx + 1, e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push(PageImage::new(idx, image));
    }

    Ok(results)
}

/// Decode a scanned page, scaling it down when it exceeds the pixel cap.
fn render_raster(bytes: &[u8], options: &RenderOptions) -> Result<Vec<PageImage>, DocumentError> {
    let image = image::load_from_memory(bytes).map_err(|e| DocumentError::UnreadableDocument {
        detail: format!("corrupt image: {}", e),
    })?;
    let image = cap_dimensions(image, options.max_rendered_pixels);
    debug!("Decoded image page → {}x{} px", image.width(), image.height());
    Ok(vec![PageImage::new(0, image)])
}

fn cap_dimensions(image: DynamicImage, max_pixels: u32) -> DynamicImage {
    if image.width() <= max_pixels && image.height() <= max_pixels {
        image
    } else {
        image.resize(max_pixels, max_pixels, image::imageops::FilterType::Triangle)
    }
}
